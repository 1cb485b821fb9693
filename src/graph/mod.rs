pub mod hops;
