pub mod errors;
pub mod id;
pub mod protocol;
pub mod types;

pub use errors::{CallError, ConfigError, DeviceError, ParleyError};
pub use id::{new_id, CallId, EndpointId};
pub use protocol::{
    ClientMessage, ErrorCode, IceCandidate, Namespace, Negotiation, RejectReason, SdpType,
    ServerMessage, SessionDescription,
};
pub use types::{CallKind, ConnectionState, Endpoint};

pub type Result<T> = std::result::Result<T, ParleyError>;
