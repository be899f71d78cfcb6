pub mod channel;
pub mod client;
pub mod deadline;
mod feeder;
pub mod scripted;
mod session;
pub mod stream;
pub mod translate;
pub mod transport_trait;

pub use channel::ChannelAdapter;
pub use client::{last_final_transcript, RecognitionClient, EMPTY_TRANSCRIPT};
pub use deadline::Deadline;
pub use scripted::{CallRecord, ScriptStep, ScriptedTransport};
pub use stream::{RecognitionStream, StopHandle};
pub use translate::{translate, MAX_TEXT_BYTES};
pub use transport_trait::{CallObserver, DuplexCall, DuplexTransport};
