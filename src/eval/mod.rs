pub mod assertion;
pub mod awaiting;
pub mod case;
pub mod checkpoint;
pub mod executor;
pub mod loader;
pub mod machine;
pub mod report;
pub mod runner;
pub mod stability;
