pub mod models;
pub mod session;
pub mod tls;
pub mod transport;

pub use session::{ApiCall, ApiMethod, ApiSession, RetryPolicy};
pub use transport::{HttpRequest, HttpResponse, ReqwestTransport, ScriptedTransport, Transport};
