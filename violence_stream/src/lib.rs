mod routes;

pub mod app;
pub mod camera;
pub mod channel;
pub mod config;
pub mod encoder;
pub mod frame;
pub mod prediction;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod sink;
pub mod telemetry;
pub mod transport;

pub use app::start_app;
pub use channel::{FrameSender, PredictionChannel};
pub use prediction::Prediction;
pub use session::{Session, SessionError, SessionSettings};
pub use sink::PredictionSink;
pub use transport::{ConnectionState, FrameTransport};
