pub mod types;

pub use types::{
    Account, Balance, ExecutedOrder, OrderRequest, OrderSide, OrderStatus, OrderType, Position,
    PositionType,
};
