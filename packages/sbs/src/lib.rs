//! Runtime for the SBS schema-driven binary serialization format.
//!
//! A _schema_ describes how a structure of semantic primitives is encoded as
//! raw bytes, and is itself a data structure that can be built and passed
//! around at runtime. Schemas are registered in a [`Repository`] under a
//! `(module, name)` pair and may reference each other by name, so a protocol
//! can ship its envelope schema and let applications register their payload
//! schemas next to it.
//!
//! Typical usage pattern:
//!
//! - build a [`Repository`] (built-in types are pre-registered)
//! - register application types with [`Repository::register`], or merge in
//!   another repository with [`Repository::merge`]
//! - encode a [`Value`] with [`Repository::encode`], decode bytes with
//!   [`Repository::decode`]
//!
//! The data model supports:
//!
//! - variable length signed integers
//! - booleans
//! - utf8 strings, byte strings
//! - optionals
//! - variable length homogenous lists
//! - records (values back-to-back, fields have names at schema-time)
//! - unions, as in tagged unions, as in "one of"
//! - references to other registered types, so compound schemas don't have to
//!   be inlined into one another

pub mod error;
pub mod var_len;

mod repo;
mod schema;
mod value;

pub use crate::{
    repo::Repository,
    schema::{
        RecordField,
        Schema,
        UnionVariant,
    },
    value::{
        RecordValueField,
        Value,
    },
};
