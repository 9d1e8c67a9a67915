pub mod errors;
pub mod ids;
pub mod model;

pub use errors::{CoreError, CoreResult};
pub use ids::{ChannelId, ParticipantId, SessionId, UserId};
pub use model::{
    AudioFormat, AuditRecord, ChannelDescriptor, Coordinates, NetworkQuality, Participant,
    TransmissionMeta,
};
