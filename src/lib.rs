pub mod body;
pub mod cache;
pub mod headers;
pub mod interceptors;
pub mod logging;
pub mod pipeline;
pub mod request;
pub mod response;
pub mod transport;
pub mod util;

pub use body::BodyStream;
pub use cache::{CacheOptions, HttpCache};
pub use pipeline::{
    ErrorAction, FnInterceptor, Interceptor, Pipeline, RequestAction, ResponseAction,
};
pub use request::{HttpRequest, RequestBody, SharedBodyStream};
pub use response::StreamedResponse;
pub use transport::{Transport, TransportError};
