pub use config_io::load_cfg;
pub use core_pinner::*;
pub use health_flag::*;
pub use state::*;

mod config_io;
pub(crate) mod core_pinner;
pub(crate) mod health_flag;
pub mod logger;
pub(crate) mod state;
