//! Cross-instance cache invalidation.
//!
//! Every running instance publishes its evictions on a shared channel and
//! applies the evictions of its peers to its local cache:
//!
//! ```text
//! ┌────────────┐  publish   ┌──────────────────┐  deliver   ┌────────────┐
//! │ Instance A │ ─────────▶ │ PubSubTransport  │ ─────────▶ │ Instance B │
//! │            │ ◀───────── │ (shared channel) │            │ on_message │
//! └────────────┘  own echo  └──────────────────┘            └─────┬──────┘
//!   (dropped)                                                     │ dispatch
//!                                                                 ▼
//!                                                           LocalEvictor
//!                                                         (never publishes)
//! ```

pub mod bus;
pub mod message;
pub mod transport;

pub use bus::{BusStats, Delivery, InvalidationBus, LocalEvictor, StoreEvictor};
pub use message::{InvalidationMessage, MessageType};
pub use transport::{InProcessTransport, PubSubTransport, Subscription};
