//! Shared vocabulary for the kvrepo data-access layer.
//!
//! This crate is pure: it performs no I/O and owns no connections. It defines
//! how domain scalars travel to and from the store and the small option types
//! that parameterise store commands.
//!
//! # Modules
//!
//! - [`wire`] -- [`WireValue`] (what we send) and [`Reply`] (what the store answers)
//! - [`codec`] -- The typed codec: [`WireCodec`] for the supported scalar set
//! - [`options`] -- Conditional-set, ordering, set-operation and score-range options
//! - [`script_args`] -- Fixed-slot key/argument bundle for server-side scripts
//! - [`keyspace`] -- Namespace prefixing for keys

pub mod codec;
pub mod keyspace;
pub mod options;
pub mod script_args;
pub mod wire;

pub use codec::{decode, decode_array, CodecError, Nullable, WireCodec};
pub use keyspace::KeySpace;
pub use options::{Aggregation, Exclude, ScoreBound, ScoreRange, SetOperation, SortOrder, When};
pub use script_args::{
    ScriptArgs, ScriptParam, SlotError, SlotKind, ARG_SLOTS, KEY_SLOTS,
};
pub use wire::{format_double, Reply, WireValue};
