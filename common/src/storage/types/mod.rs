pub mod openie;
pub mod query_solution;
pub mod triple;

pub use openie::{NerOut, OpenIeDoc, TripleOut};
pub use query_solution::QuerySolution;
pub use triple::Triple;
