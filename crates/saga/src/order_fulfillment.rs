//! The `order-fulfillment` saga.
//!
//! Reserves stock, charges the customer and books shipping. A failure rolls
//! back whatever already succeeded, in reverse order.

use std::time::Duration;

use crate::definition::{ActionDescriptor, SagaDefinition, StepDefinition};
use crate::retry::RetryPolicy;

/// The saga type identifier for order fulfillment.
pub const SAGA_TYPE: &str = "order-fulfillment";

pub const STEP_RESERVE_INVENTORY: &str = "reserveInventory";

pub const STEP_CHARGE_PAYMENT: &str = "chargePayment";

pub const STEP_SCHEDULE_SHIPPING: &str = "scheduleShipping";

/// Builds the order fulfillment definition.
pub fn definition() -> SagaDefinition {
    let retry = RetryPolicy::exponential(3, Duration::from_millis(200))
        .with_max_delay(Duration::from_secs(2));

    SagaDefinition::builder(SAGA_TYPE)
        .step(
            StepDefinition::new(
                STEP_RESERVE_INVENTORY,
                ActionDescriptor::http("POST", "http://inventory/reservations"),
            )
            .compensate_with(ActionDescriptor::http(
                "DELETE",
                "http://inventory/reservations",
            ))
            .timeout(Duration::from_secs(10))
            .retry(retry.clone()),
        )
        .step(
            StepDefinition::new(
                STEP_CHARGE_PAYMENT,
                ActionDescriptor::http("POST", "http://payments/charges"),
            )
            .compensate_with(ActionDescriptor::http("POST", "http://payments/refunds"))
            .timeout(Duration::from_secs(15))
            .retry(retry.clone()),
        )
        .step(
            StepDefinition::new(
                STEP_SCHEDULE_SHIPPING,
                ActionDescriptor::publish("shipping.schedule"),
            )
            .compensate_with(ActionDescriptor::publish("shipping.cancel"))
            .timeout(Duration::from_secs(10))
            .retry(retry),
        )
        .build()
}
