//! # Marquee
//!
//! Marquee is the runtime core of a game/network server: connections' byte streams are cut
//! into messages, messages are routed to single-threaded actors, and actors hand slow work
//! to worker pools without ever blocking their own loop.
//!
//! ## Core Features
//!
//! * **Wire format**: 2-byte little-endian length followed by a UTF-8 JSON object
//! * **Stream deframing**: a fixed ring per connection that survives partial reads and
//!   wraparound, and refuses to overwrite unread bytes
//! * **Actor loop**: paced frames that drain the inbox, shed overload, fire timers and
//!   resume waiting tasks
//! * **Resumable tasks**: straight-line actor code that waits for worker replies by id
//!
//! ## Architecture
//!
//! * [`StreamDeframer`]: owned by whatever reads a socket; yields [`WireFrame`]s
//! * [`ActorLoop`]: drives one [`Actor`]; talked to through an [`ActorHandle`]
//! * [`TimerSet`] and [`TaskTable`]: owned by the actor through its [`ActorCore`]
//! * [`Handler`]: components started beside an actor (network listeners, worker pumps)

pub mod actor;
pub mod clock;
pub mod config;
pub mod deframer;
pub mod errors;
pub mod handler;
pub mod logging;
pub mod messages;
pub mod metrics;
pub mod notify;
pub mod shutdown;
pub mod tasks;
pub mod timers;
pub mod wire;

pub use actor::{Actor, ActorCore, ActorHandle, ActorLoop, ActorPhase, LoopSettings};
pub use clock::Clock;
pub use config::MarqueeConfig;
pub use deframer::StreamDeframer;
pub use errors::{
    ActorError, ConfigError, DeframeError, FrameDecodeError, OutboundError, TaskError,
    TimerError, WireError,
};
pub use handler::{Handler, HandlerRegistry};
pub use messages::{ConnId, Envelope, NetCommand, NetEvent, NetOutbound};
pub use metrics::LoopMetrics;
pub use notify::{AsyncNotify, NotifyStatus};
pub use shutdown::{ShutdownController, ShutdownReceiver, ShutdownSignal, ShutdownType};
pub use tasks::{Resumer, Suspension, TaskId, TaskTable};
pub use timers::{TimerHost, TimerSet};
pub use wire::{FrameLimits, WireCodec, WireFrame};
