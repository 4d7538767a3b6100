pub mod tiles;
pub mod worker;
