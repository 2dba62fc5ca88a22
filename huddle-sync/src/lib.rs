//! # huddle-sync: Shared key-value state for small live sessions
//!
//! Every participant holds a full mirror of one shared document and
//! publishes its own per-participant state (presence, availability, photos,
//! conversation requests) through a broadcast store with a small per-delta
//! size limit.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  write/remove   ┌──────────────┐  Delta   ┌─────────────┐
//! │ application  │ ──────────────► │  SyncEngine  │ ───────► │ Transport   │
//! │ (per user)   │ ◄────────────── │  (mirror,    │          │ (Hub or     │
//! └──────────────┘  ExternalChange │   echo,      │ ◄─────── │  host)      │
//!                                  │   clock)     │ Notific. └─────────────┘
//!                                  └──────────────┘
//! ```
//!
//! Values larger than one delta allows are split into content-addressed
//! parts (`<key>/_/<sha256>/<index>`) behind a pointer entry
//! (`<key> → "<sha256>:<count>"`); a key reads as absent until every part
//! of the version its pointer names has arrived.
//!
//! ## Modules
//!
//! - [`chunk`]: Part keys, manifests, split/join
//! - [`batch`]: Packing entries into size-bounded deltas
//! - [`mirror`]: Local raw copy of the document and its logical view
//! - [`echo`]: Suppression of this participant's own notifications
//! - [`clock`]: Session time from transport commit timestamps
//! - [`engine`]: The per-participant orchestrator
//! - [`key`]: Key validation and the typed `<owner>/<resource>` schema
//! - [`hub`]: In-memory broadcast store implementing [`Transport`]
//! - [`protocol`]: Bincode frames on the hub channel
//! - [`session`]: Tokio actor around an engine
//!
//! ## Guarantees
//!
//! | Property | Holds |
//! |----------|-------|
//! | Local write readable before its echo | always |
//! | Peer never reads a partially arrived value | always |
//! | Every delta ≤ `max_delta_size` | always |
//! | Duplicate notification reported twice | never |

pub mod batch;
pub mod chunk;
pub mod clock;
pub mod config;
pub mod echo;
pub mod engine;
pub mod error;
pub mod hub;
pub mod key;
pub mod mirror;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use batch::Delta;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DeltaLimits, SyncConfig};
pub use engine::{EngineStats, ExternalChange, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use hub::{Hub, HubConfig, HubStats, HubTransport, NotificationStream};
pub use key::{ParticipantId, Resource, ResourceKey, ResourceKind};
pub use protocol::{HubFrame, ProtocolError};
pub use session::{Session, SessionConfig, SessionHandle};
pub use transport::{AddedEntry, Notification, Transport, TransportError};
