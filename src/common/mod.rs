mod closest_contacts;
mod contact;
mod id;
pub mod messages;
mod routing_table;
mod value;

pub use closest_contacts::*;
pub use contact::*;
pub use id::*;
pub use messages::{Reply, Request, Token};
pub use routing_table::*;
pub use value::*;
