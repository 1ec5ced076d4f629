#[macro_use]
pub mod util;

pub mod cli;
pub mod emulate;
pub mod error;
pub mod executor;
pub mod formula;
pub mod handler;
pub mod ir;
pub mod lift;
pub mod path_exploration;
pub mod record;
pub mod slicing;
pub mod solver;
pub mod state;
pub mod taint;
