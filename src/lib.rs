//! MissionLink Core - mission bank synchronization with a flight controller
//!
//! **Creator**: Shayan Golmezerji
//! **License**: Creative Commons Attribution 4.0 International (CC BY 4.0)
//!
//! Keeps the ground station's mission (banks of waypoint info-slots) in step
//! with what is stored on the vehicle, over a lossy byte link.
//!
//! # Layers
//! - [`codec`]: CRC8-protected frames with a resynchronizing decoder
//! - [`channel`]: per-connection rolling counter and loss statistics
//! - [`ack_manager`]: single outstanding request with bounded retry
//! - [`sync_engine`]: Read / Write / Remove-All transactions, sans I/O
//! - [`bridge`]: bytes in, bytes and events out, for one vehicle
//! - [`link`]: tokio driver with an async handle
//!
//! ```no_run
//! # async fn demo() -> missionlink_core::Result<()> {
//! use missionlink_core::{link, SyncConfig, VehicleLink};
//!
//! let stream = tokio::net::TcpStream::connect("127.0.0.1:5760")
//!     .await
//!     .map_err(|_| missionlink_core::SyncError::LinkClosed)?;
//! let transport = link::stream_transport(stream);
//! let (vehicle, _events) = VehicleLink::spawn(SyncConfig::default(), transport)?;
//! let mission = vehicle.read_mission().await?;
//! println!("{} banks, {} slots", mission.banks.len(), mission.slot_count());
//! # Ok(())
//! # }
//! ```

pub mod ack_manager;
pub mod bridge;
pub mod channel;
pub mod codec;
pub mod config;
pub mod contracts;
pub mod errors;
pub mod link;
pub mod logging;
pub mod receiver;
pub mod sim;
pub mod sync_engine;
pub mod transmitter;

pub use bridge::{MissionSink, SessionOutput, SyncEvent, VehicleBridge};
pub use channel::{ChannelState, LinkStats};
pub use codec::{Frame, MsgClass, MAGIC};
pub use config::SyncConfig;
pub use contracts::{BankRecord, BankRequest, BankSummary, InfoSlot, Mission, MissionBank};
pub use errors::{Result, SyncError};
pub use link::VehicleLink;
pub use sync_engine::{Completion, SyncEngine, SyncState, TransactionKind};

/// Ground station address on the link
pub const DEFAULT_GROUND_ID: u16 = 0x00FE;

/// Flight controller address on the link
pub const DEFAULT_VEHICLE_ID: u16 = 0x0001;

/// ACK timeout duration in milliseconds
pub const ACK_TIMEOUT_MS: u64 = 500;

/// Retries of one request before the transaction aborts
pub const MAX_RETRIES: u32 = 5;

/// Receive buffer size per connection
pub const RECEIVE_BUFFER_CAPACITY: usize = 4096;

/// Frames between two link statistics reports
pub const STATS_WINDOW: u32 = 32;
