mod check;
mod position;
mod run;
mod table;

pub use check::cmd_check;
pub use position::cmd_position;
pub use run::cmd_run;
pub use table::cmd_table;
