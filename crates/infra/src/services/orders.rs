//! Order ledger operations: creation, production moves, manual holds and
//! shipment sync.

use std::sync::Arc;

use chrono::Utc;

use podledger_auth::{Permission, Principal, authorize};
use podledger_core::{AggregateId, LineId, UserId};
use podledger_orders::{
    AssignDesigner, CreateOrder, LineStatus, NewLine, Order, OrderCommand, OrderId, OrderStatus,
    ReleaseHold, SetLineStatus, TransitionStatus,
};

use super::{EnvelopeBus, all_orders, ensure_owner_or, load_order};
use crate::command_dispatcher::{CommandDispatcher, DispatchError};
use crate::event_store::EventStore;
use crate::external::{Notification, NotificationService, ShipmentTracker};
use crate::retry::with_retries;
use crate::streams::ORDER_STREAM;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrder {
    pub seller_id: UserId,
    pub code: String,
    pub customer_ref: String,
    pub lines: Vec<NewLine>,
}

pub struct OrderLedgerService<S, B> {
    dispatcher: Arc<CommandDispatcher<S, B>>,
    tracker: Arc<dyn ShipmentTracker>,
    notifier: Arc<dyn NotificationService>,
    max_retries: u32,
}

impl<S, B> OrderLedgerService<S, B>
where
    S: EventStore,
    B: EnvelopeBus,
{
    pub fn new(
        dispatcher: Arc<CommandDispatcher<S, B>>,
        tracker: Arc<dyn ShipmentTracker>,
        notifier: Arc<dyn NotificationService>,
        max_retries: u32,
    ) -> Self {
        Self {
            dispatcher,
            tracker,
            notifier,
            max_retries,
        }
    }

    /// Create an order in `Draft`. Sellers create for themselves; staff may
    /// create on a seller's behalf.
    #[tracing::instrument(skip_all, fields(code = %new_order.code))]
    pub fn create_order(
        &self,
        principal: &Principal,
        new_order: NewOrder,
    ) -> Result<Order, DispatchError> {
        authorize(principal, &Permission::ORDERS_CREATE)?;
        ensure_owner_or(
            principal,
            Some(new_order.seller_id),
            &Permission::ORDERS_TRANSITION,
        )?;

        let order_id = OrderId::new(AggregateId::new());
        let (order, _) = self.dispatcher.execute(
            order_id.0,
            ORDER_STREAM,
            OrderCommand::CreateOrder(CreateOrder {
                order_id,
                seller_id: new_order.seller_id,
                code: new_order.code,
                customer_ref: new_order.customer_ref,
                lines: new_order.lines,
                actor: principal.user_id,
                occurred_at: Utc::now(),
            }),
            |id| Order::empty(OrderId::new(id)),
        )?;

        tracing::info!(order_id = %order_id, total = order.total_cost(), "order created");
        Ok(order)
    }

    /// Move an order along the production table. `Hold` is a manual hold
    /// that `release_hold` undoes.
    #[tracing::instrument(skip_all, fields(order_id = %order_id, target = ?target))]
    pub fn transition(
        &self,
        principal: &Principal,
        order_id: OrderId,
        target: OrderStatus,
    ) -> Result<Order, DispatchError> {
        authorize(principal, &Permission::ORDERS_TRANSITION)?;
        let actor = principal.user_id;

        let (order, changed) = self.run_committed(order_id, "orders.transition", || {
            OrderCommand::TransitionStatus(TransitionStatus {
                order_id,
                target,
                actor,
                occurred_at: Utc::now(),
            })
        })?;
        if changed {
            tracing::info!(status = ?order.status(), "order status changed");
            self.notify_seller(&order);
        }
        Ok(order)
    }

    #[tracing::instrument(skip_all, fields(order_id = %order_id))]
    pub fn release_hold(
        &self,
        principal: &Principal,
        order_id: OrderId,
    ) -> Result<Order, DispatchError> {
        authorize(principal, &Permission::ORDERS_TRANSITION)?;
        let actor = principal.user_id;

        let (order, changed) = self.run_committed(order_id, "orders.release_hold", || {
            OrderCommand::ReleaseHold(ReleaseHold {
                order_id,
                actor,
                occurred_at: Utc::now(),
            })
        })?;
        if changed {
            self.notify_seller(&order);
        }
        Ok(order)
    }

    pub fn assign_designer(
        &self,
        principal: &Principal,
        order_id: OrderId,
        line_id: LineId,
        designer: UserId,
    ) -> Result<Order, DispatchError> {
        authorize(principal, &Permission::ORDERS_TRANSITION)?;
        let actor = principal.user_id;

        self.run(order_id, "orders.assign_designer", || {
            OrderCommand::AssignDesigner(AssignDesigner {
                order_id,
                line_id,
                designer,
                actor,
                occurred_at: Utc::now(),
            })
        })
    }

    pub fn set_line_status(
        &self,
        principal: &Principal,
        order_id: OrderId,
        line_id: LineId,
        status: LineStatus,
    ) -> Result<Order, DispatchError> {
        authorize(principal, &Permission::ORDERS_TRANSITION)?;
        let actor = principal.user_id;

        self.run(order_id, "orders.set_line_status", || {
            OrderCommand::SetLineStatus(SetLineStatus {
                order_id,
                line_id,
                status,
                actor,
                occurred_at: Utc::now(),
            })
        })
    }

    /// Ask the carrier about a confirmed order and mark it shipped once the
    /// parcel has been handed over. Other orders are returned unchanged.
    #[tracing::instrument(skip_all, fields(order_id = %order_id))]
    pub fn sync_shipment(&self, order_id: OrderId) -> Result<Order, DispatchError> {
        let loaded = load_order(&self.dispatcher, order_id)?;
        let order = loaded.aggregate;
        if order.status() != OrderStatus::Confirmed {
            return Ok(order);
        }

        let shipment = self.tracker.shipment_status(order.code())?;
        if !shipment.is_shipped() {
            tracing::debug!(shipment = ?shipment, "parcel not handed over yet");
            return Ok(order);
        }

        let actor = Principal::system().user_id;
        let (order, changed) = self.run_committed(order_id, "orders.sync_shipment", || {
            OrderCommand::TransitionStatus(TransitionStatus {
                order_id,
                target: OrderStatus::Shipped,
                actor,
                occurred_at: Utc::now(),
            })
        })?;
        if changed {
            tracing::info!("order shipped");
            self.notify_seller(&order);
        }
        Ok(order)
    }

    pub fn get_order(&self, principal: &Principal, order_id: OrderId) -> Result<Order, DispatchError> {
        let order = load_order(&self.dispatcher, order_id)?.aggregate;
        ensure_owner_or(principal, order.seller_id(), &Permission::ORDERS_TRANSITION)?;
        Ok(order)
    }

    /// Orders of one seller, oldest first.
    pub fn list_orders(
        &self,
        principal: &Principal,
        seller_id: UserId,
    ) -> Result<Vec<Order>, DispatchError> {
        ensure_owner_or(principal, Some(seller_id), &Permission::ORDERS_TRANSITION)?;
        Ok(all_orders(&self.dispatcher)?
            .into_iter()
            .map(|r| r.aggregate)
            .filter(|o| o.seller_id() == Some(seller_id))
            .collect())
    }

    fn run(
        &self,
        order_id: OrderId,
        operation: &str,
        command: impl Fn() -> OrderCommand,
    ) -> Result<Order, DispatchError> {
        self.run_committed(order_id, operation, command)
            .map(|(order, _)| order)
    }

    /// Like `run`, also reporting whether anything was appended.
    fn run_committed(
        &self,
        order_id: OrderId,
        operation: &str,
        command: impl Fn() -> OrderCommand,
    ) -> Result<(Order, bool), DispatchError> {
        with_retries(operation, self.max_retries, |_| {
            let (order, committed) =
                self.dispatcher
                    .execute(order_id.0, ORDER_STREAM, command(), |id| {
                        Order::empty(OrderId::new(id))
                    })?;
            Ok((order, !committed.is_empty()))
        })
    }

    fn notify_seller(&self, order: &Order) {
        let Some(seller) = order.seller_id() else {
            return;
        };
        let result = self.notifier.notify(Notification {
            user_id: seller,
            message: format!("Order {} is now {:?}", order.code(), order.status()),
            redirect_url: format!("/orders/{}", order.id_typed()),
        });
        if let Err(err) = result {
            tracing::warn!(error = %err, "failed to notify seller");
        }
    }
}
