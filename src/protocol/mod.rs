pub mod ast;
pub mod registry;

pub use ast::{Declaration, Interaction, Message, Module, ProtocolDecl, Role, TypeExpr};
pub use registry::{ProtocolEntry, ProtocolRegistry};
