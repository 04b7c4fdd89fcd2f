//! # Generation Protocol
//!
//! Wire-level vocabulary between the course generation engine and the
//! generation backend:
//!
//! - **Requests**: what the engine asks the backend to generate or modify
//! - **Events**: the typed records the backend streams back
//! - **Parser**: incremental decoding of the raw record stream
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Generation Protocol                          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  GenerationRequest ──► backend ──► raw bytes                    │
//! │                                        │                        │
//! │                                        ▼                        │
//! │                     EventParser ──► GenerationEvent             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod event;
pub mod material;
pub mod parser;
pub mod request;

pub use event::{
    ChangeType, CompletePayload, ContentDelta, ErrorPayload, EventKind, GenerationEvent,
    LineSpan, ProgressPayload, StartPayload, TargetedChangePayload,
};
pub use material::{Coordinates, MaterialKind, UnitKind};
pub use parser::{
    DEFAULT_MAX_RECORD_BYTES, DEFAULT_RECORD_MARKER, EventParser, ParserConfig, ParserStats,
    decode_stream,
};
pub use request::{GenerationRequest, Operation};
