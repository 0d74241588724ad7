//! Compiles audience segment condition trees into parameterized PostgreSQL queries.
//!
//! ```
//! use segment_query::ast::{DimensionFilter, TreeNode};
//! use segment_query::sql_compiler::SegmentCompiler;
//!
//! let compiler = SegmentCompiler::new();
//! let tree = TreeNode::or(vec![
//!     TreeNode::contacts(vec![DimensionFilter::new("country", "equals").with_strings(["US"])]),
//!     TreeNode::contacts(vec![DimensionFilter::new("country", "equals").with_strings(["CA"])]),
//! ]);
//! let query = compiler.compile(&tree).unwrap();
//! assert_eq!(query.sql, "SELECT email FROM contacts WHERE (country = $1 OR country = $2)");
//! assert_eq!(query.args.len(), 2);
//! ```

pub mod aggregate;
pub mod ast;
pub mod config;
pub mod error;
pub mod filter;
pub mod json_path;
pub mod registry;
pub mod sql_compiler;
pub mod validate;

pub use error::{CompileError, ConfigError};
pub use sql_compiler::{CompiledQuery, CompilerConfig, SegmentCompiler};
