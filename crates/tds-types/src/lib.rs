//! # tds-types
//!
//! Value model and type registry for TDS column and parameter data.
//!
//! The token decoder treats column data as opaque: COLMETADATA, ROW, NBCROW
//! and RETURNVALUE tokens delegate every TYPE_INFO record and every value to
//! a [`TypeRegistry`]. [`StandardRegistry`] covers the common types so the
//! protocol core can be exercised end to end; richer registries plug in
//! through the same trait.
//!
//! ## Type Mappings
//!
//! | SQL Server Type | [`Value`] variant |
//! |-----------------|-------------------|
//! | `BIT` | `Bool` |
//! | `TINYINT` | `TinyInt` |
//! | `SMALLINT` | `SmallInt` |
//! | `INT` | `Int` |
//! | `BIGINT` | `BigInt` |
//! | `REAL` | `Real` |
//! | `FLOAT` | `Float` |
//! | `CHAR`/`VARCHAR` | `String` (decoded with the collation's code page) |
//! | `NCHAR`/`NVARCHAR` | `String` |
//! | `BINARY`/`VARBINARY` | `Binary` |
//! | `UNIQUEIDENTIFIER` | `Uuid` |

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod descriptor;
pub mod error;
pub mod registry;
pub mod value;

pub use descriptor::{
    LengthKind, MAX_LENGTH_PLP, TypeDescriptor, TypeId, encoding_for_collation,
};
pub use error::TypeError;
pub use registry::{StandardRegistry, TypeRegistry, ValueReader};
pub use value::Value;
