pub mod util;
pub use util::*;

mod error;
pub use error::*;

mod config;
pub use config::*;

mod hypergraph;
pub use hypergraph::*;

mod priority_queue;
pub use priority_queue::*;

mod floorplan;
pub use floorplan::*;

mod cost_model;
pub use cost_model::*;

mod refiner;
pub use refiner::*;

mod initial_partition;
pub use initial_partition::*;

mod file_writer;
pub use file_writer::*;

mod chiplet_part;
pub use chiplet_part::*;

mod genetic;
pub use genetic::*;

mod canonical_ga;
pub use canonical_ga::*;
