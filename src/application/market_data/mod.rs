pub mod mux;

pub use mux::{StreamMux, SubscriptionSink};
