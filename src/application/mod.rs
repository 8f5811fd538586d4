pub mod bootstrap;
pub mod recalculation;
pub mod session;
pub mod timer;
pub mod tracker;
