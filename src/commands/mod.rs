pub mod gate;
pub mod run;
pub mod utils;

pub use gate::resolve_config_path;
