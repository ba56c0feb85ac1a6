//! Trader role: order gateways, arbitrage planning, and the persisted
//! transaction coordinator.

mod coordinator;
mod gateway;
mod planner;

pub use coordinator::{ArbitrageCoordinator, CoordinatorConfig, RecoveryReport};
pub use gateway::{
    place_with_retry, GatewayCredentials, GatewayError, OrderGateway, PlaceOrder, Placement,
    RestOrderGateway, RouterGateway,
};
pub use planner::{ArbitragePlan, ArbitragePlanner, BboPlanner};
