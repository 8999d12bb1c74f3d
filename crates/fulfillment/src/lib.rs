//! Transfer & pickup domain: job staging and the pick-list read model.

pub mod pick_list;
pub mod staging;

pub use pick_list::*;
pub use staging::*;
