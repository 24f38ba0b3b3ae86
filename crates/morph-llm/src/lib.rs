pub mod http;
pub mod mock;
pub mod transcript;
pub mod transport;

pub use http::{Endpoint, HttpBackend};
pub use mock::{ScriptedBackend, ScriptedResponse};
pub use transcript::{TranscriptEntry, TranscriptLog, TRANSCRIPT_CAPACITY};
pub use transport::{CallExtras, Transport};
