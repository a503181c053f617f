//! Chain model: typed definitions, file parsing, structural validation.

pub mod definition;
pub mod parse;
mod validate;

pub use definition::{
    output_key, ChainAnnotations, ChainDefinition, Edge, GraphType, InputSource, Node,
};
pub use parse::{parse, parse_file, ChainFormat};
