pub mod candle;
pub mod interval;
pub mod status;
pub mod stream;

pub use candle::Candle;
pub use interval::{Interval, Timespan};
pub use status::{ConnectionStatus, EngineStatus};
pub use stream::CandleStream;
