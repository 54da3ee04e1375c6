use chrono::{Datelike, Utc};
use podledger_core::{AggregateId, UserId};
use podledger_infra::config::AppConfig;
use podledger_infra::webhook::signature::sign;
use reqwest::StatusCode;
use serde_json::{Value, json};

const SECRET: &str = "black-box-secret";

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        let config = AppConfig {
            payos_secret: SECRET.to_string(),
            sepay_secret: SECRET.to_string(),
            ..AppConfig::default()
        };

        // Same router as prod, bound to an ephemeral port.
        let app = podledger_api::app::build_app(&config)
            .await
            .expect("failed to build app");
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, handle }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Clone)]
struct Actor {
    user_id: UserId,
    roles: &'static str,
}

impl Actor {
    fn seller() -> Self {
        Self {
            user_id: UserId::new(),
            roles: "seller",
        }
    }

    fn manager() -> Self {
        Self {
            user_id: UserId::new(),
            roles: "manager",
        }
    }
}

struct Client {
    http: reqwest::Client,
    base_url: String,
}

impl Client {
    fn new(srv: &TestServer) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: srv.base_url.clone(),
        }
    }

    async fn get(&self, actor: &Actor, path: &str) -> (StatusCode, Value) {
        let res = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .header("x-user-id", actor.user_id.to_string())
            .header("x-roles", actor.roles)
            .send()
            .await
            .unwrap();
        let status = res.status();
        (status, res.json().await.unwrap_or(Value::Null))
    }

    async fn post(&self, actor: &Actor, path: &str, body: Value) -> (StatusCode, Value) {
        let res = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .header("x-user-id", actor.user_id.to_string())
            .header("x-roles", actor.roles)
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = res.status();
        (status, res.json().await.unwrap_or(Value::Null))
    }

    async fn webhook(&self, source: &str, body: &str, signature: Option<&str>) -> (StatusCode, Value) {
        let mut req = self
            .http
            .post(format!("{}/webhooks/{}", self.base_url, source))
            .header("content-type", "application/json")
            .body(body.to_string());
        if let Some(sig) = signature {
            req = req.header("x-signature", sig);
        }
        let res = req.send().await.unwrap();
        let status = res.status();
        (status, res.json().await.unwrap_or(Value::Null))
    }

    async fn create_order(&self, seller: &Actor, code: &str, unit_price: u64) -> Value {
        let (status, body) = self
            .post(
                seller,
                "/orders",
                json!({
                    "code": code,
                    "customer_ref": "customer-1",
                    "lines": [{
                        "variant_sku": "TEE-M-BLACK",
                        "product_name": "Tee",
                        "quantity": 1,
                        "unit_price": unit_price,
                    }],
                }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        body
    }

    async fn ship(&self, staff: &Actor, order_id: &str) {
        for target in [
            "ready_production",
            "in_production",
            "qc_pending",
            "qc_approved",
            "confirmed",
            "shipped",
        ] {
            let (status, body) = self
                .post(
                    staff,
                    &format!("/orders/{order_id}/transition"),
                    json!({ "status": target }),
                )
                .await;
            assert_eq!(status, StatusCode::OK, "{target}: {body}");
        }
    }
}

#[tokio::test]
async fn identity_required_for_protected_endpoints() {
    let srv = TestServer::spawn().await;

    let http = reqwest::Client::new();
    let res = http
        .get(format!("{}/whoami", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = http
        .get(format!("{}/health", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn identity_is_derived_from_headers() {
    let srv = TestServer::spawn().await;
    let client = Client::new(&srv);
    let actor = Actor {
        user_id: UserId::new(),
        roles: "seller, system",
    };

    let (status, body) = client.get(&actor, "/whoami").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["user_id"].as_str().unwrap(), actor.user_id.to_string());
    assert_eq!(body["roles"], json!(["seller"]));
    assert!(
        !body["permissions"]
            .as_array()
            .unwrap()
            .iter()
            .any(|p| p == "payments.record")
    );
}

#[tokio::test]
async fn order_invoice_and_payment_lifecycle() {
    let srv = TestServer::spawn().await;
    let client = Client::new(&srv);
    let seller = Actor::seller();
    let staff = Actor::manager();

    let order = client.create_order(&seller, "PL-1001", 500_000).await;
    let order_id = order["id"].as_str().unwrap().to_string();
    assert_eq!(order["status"], "draft");

    // Sellers cannot drive production.
    let (status, _) = client
        .post(
            &seller,
            &format!("/orders/{order_id}/transition"),
            json!({ "status": "ready_production" }),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    client.ship(&staff, &order_id).await;

    let (status, invoice) = client
        .post(
            &staff,
            "/invoices/ad-hoc",
            json!({
                "seller_id": seller.user_id.to_string(),
                "order_ids": [order_id],
                "discount_code": "SAVE10",
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{invoice}");
    assert_eq!(invoice["total_amount"], 500_000);
    assert_eq!(invoice["discount_amount"], 50_000);
    assert_eq!(invoice["payable_amount"], 450_000);
    let invoice_id = invoice["id"].as_str().unwrap().to_string();

    let (status, seen) = client.get(&seller, &format!("/invoices/{invoice_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(seen["status"], "unpaid");

    let (status, err) = client
        .post(
            &staff,
            &format!("/invoices/{invoice_id}/payments"),
            json!({ "amount": 500_000 }),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(err["error"], "amount_exceeds_balance");

    let (status, paid) = client
        .post(
            &staff,
            &format!("/invoices/{invoice_id}/payments"),
            json!({ "amount": 450_000 }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(paid["status"], "paid");
    assert_eq!(paid["applied"], true);

    let (_, order) = client.get(&seller, &format!("/orders/{order_id}")).await;
    assert_eq!(order["invoice_id"].as_str().unwrap(), invoice_id);
}

#[tokio::test]
async fn monthly_invoice_runs_once_per_period() {
    let srv = TestServer::spawn().await;
    let client = Client::new(&srv);
    let seller = Actor::seller();
    let staff = Actor::manager();

    let order = client.create_order(&seller, "PL-2001", 120_000).await;
    client.ship(&staff, order["id"].as_str().unwrap()).await;

    let now = Utc::now();
    let body = json!({
        "seller_id": seller.user_id.to_string(),
        "year": now.year(),
        "month": now.month(),
    });

    let (status, invoice) = client.post(&staff, "/invoices/monthly", body.clone()).await;
    assert_eq!(status, StatusCode::CREATED, "{invoice}");
    assert_eq!(invoice["items"].as_array().unwrap().len(), 1);

    let (status, err) = client.post(&staff, "/invoices/monthly", body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"], "nothing_to_invoice");
}

#[tokio::test]
async fn webhook_settles_invoice_once() {
    let srv = TestServer::spawn().await;
    let client = Client::new(&srv);
    let seller = Actor::seller();
    let staff = Actor::manager();

    let order = client.create_order(&seller, "PL-3001", 250_000).await;
    let order_id = order["id"].as_str().unwrap().to_string();
    client.ship(&staff, &order_id).await;
    let (_, invoice) = client
        .post(
            &staff,
            "/invoices/ad-hoc",
            json!({ "seller_id": seller.user_id.to_string(), "order_ids": [order_id] }),
        )
        .await;
    let invoice_id = invoice["id"].as_str().unwrap().to_string();
    let number = invoice["number"].as_str().unwrap();

    let payload = format!(
        r#"{{"id":9001,"gateway":"MB","transferType":"in","transferAmount":250000,"content":"thanh toan {number}","referenceCode":"FT9001"}}"#
    );
    let signature = sign(SECRET, payload.as_bytes());

    let (status, _) = client.webhook("stripe", &payload, Some(&signature)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = client.webhook("sepay", &payload, Some("00ff")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = client.webhook("sepay", &payload, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let garbage = "{\"transferAmount\":";
    let (status, err) = client
        .webhook("sepay", garbage, Some(&sign(SECRET, garbage.as_bytes())))
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(status.is_server_error());
    assert_eq!(err["error"], "malformed_payload");

    let (_, unpaid) = client.get(&staff, &format!("/invoices/{invoice_id}")).await;
    assert_eq!(unpaid["amount_paid"], 0);

    let (status, body) = client.webhook("sepay", &payload, Some(&signature)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "processed");

    let (status, body) = client.webhook("sepay", &payload, Some(&signature)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "duplicate");

    let (_, paid) = client.get(&staff, &format!("/invoices/{invoice_id}")).await;
    assert_eq!(paid["status"], "paid");
    assert_eq!(paid["amount_paid"], 250_000);
    assert_eq!(paid["payments"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn rejected_cancellation_restores_order() {
    let srv = TestServer::spawn().await;
    let client = Client::new(&srv);
    let seller = Actor::seller();
    let staff = Actor::manager();

    let order = client.create_order(&seller, "PL-4001", 90_000).await;
    let order_id = order["id"].as_str().unwrap().to_string();

    let (status, request) = client
        .post(
            &seller,
            "/requests/cancellation",
            json!({ "order_id": order_id, "reason": "ordered twice" }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{request}");
    assert_eq!(request["status"], "pending");
    let request_id = request["id"].as_str().unwrap().to_string();

    let (_, held) = client.get(&seller, &format!("/orders/{order_id}")).await;
    assert_eq!(held["status"], "hold");

    let (status, err) = client
        .post(
            &seller,
            "/requests/cancellation",
            json!({ "order_id": order_id, "reason": "again" }),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(err["error"], "duplicate_request");

    let (status, _) = client
        .post(
            &seller,
            &format!("/requests/{request_id}/review"),
            json!({ "decision": "approved" }),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, reviewed) = client
        .post(
            &staff,
            &format!("/requests/{request_id}/review"),
            json!({ "decision": "rejected", "reason": "already in production" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reviewed["status"], "rejected");

    let (_, restored) = client.get(&seller, &format!("/orders/{order_id}")).await;
    assert_eq!(restored["status"], "draft");

    let (status, listed) = client
        .get(&seller, &format!("/requests?order_id={order_id}"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn bad_ids_and_foreign_resources() {
    let srv = TestServer::spawn().await;
    let client = Client::new(&srv);
    let seller = Actor::seller();
    let other = Actor::seller();

    let (status, err) = client.get(&seller, "/orders/not-a-uuid").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"], "invalid_id");

    let (status, _) = client
        .get(&seller, &format!("/orders/{}", AggregateId::new()))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let order = client.create_order(&seller, "PL-5001", 10_000).await;
    let (status, _) = client
        .get(&other, &format!("/orders/{}", order["id"].as_str().unwrap()))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}
