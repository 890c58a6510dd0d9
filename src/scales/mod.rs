pub mod advertisement;
pub mod etekcity;
pub mod traits;

pub use advertisement::*;
pub use etekcity::*;
pub use traits::*;
