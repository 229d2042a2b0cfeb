//! # Academy Chat
//!
//! Realtime chat synchronization core for the training-platform client:
//! the subsystem that keeps a consistent view of one or many
//! conversations over an unreliable, asynchronous, multiplexed event
//! channel, shared between the end-user widget and the admin console.
//!
//! ## What it does
//!
//! - Reconciles optimistic local sends with server-confirmed state
//!   (temporary ids replaced in place, never duplicated).
//! - Tolerates reconnects and out-of-order delivery: the log is always a
//!   deterministic total order by `(created_at, id)`, independent of
//!   arrival order.
//! - Debounces keystrokes into coalesced typing signals and expires
//!   stale remote indicators.
//! - Keeps unread counters and read receipts correct under interleaved
//!   events, recomputed rather than drifted.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use academy_chat::{
//!     ChatConfig, ChatSession, HttpApi, LocalUser, SessionProfile, WsTransport,
//! };
//!
//! # async fn run() -> Result<(), academy_chat::ChatError> {
//! let cfg = ChatConfig::default();
//! let api = Arc::new(HttpApi::new(&cfg.endpoints.api_url, "credential"));
//! let transport = Arc::new(WsTransport::new(&cfg.endpoints.ws_url));
//! let local = LocalUser {
//!     user_id: "u-1".into(),
//!     display_name: "Alice".into(),
//! };
//!
//! let session = ChatSession::login(
//!     cfg,
//!     local,
//!     "credential".into(),
//!     api,
//!     transport,
//!     SessionProfile::Widget,
//! )
//! .await?;
//!
//! let conversation = session.own_conversation_id().unwrap().to_string();
//! session.focus(&conversation).await;
//! session.send_message(&conversation, "hello").await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod models;
pub mod protocol;
pub mod read_receipts;
pub mod rest;
pub mod session;
pub mod store;
pub mod testing;
pub mod transport;
pub mod typing;

pub use config::{ChatConfig, load_config};
pub use connection::{ConnectionHandle, ConnectionManager, ConnectionState, Status};
pub use coordinator::MultiConversationCoordinator;
pub use error::ChatError;
pub use events::{MessageUpdate, ReceiptUpdate, TypingUpdate};
pub use models::{ConversationMeta, ConversationSummary, Delivery, LocalUser, Message};
pub use protocol::{ClientEvent, ServerEvent};
pub use rest::{ConversationApi, HttpApi};
pub use session::{ChatSession, SessionProfile};
pub use store::ConversationStore;
pub use transport::{Transport, WsTransport};
