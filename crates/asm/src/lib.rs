pub mod component;
pub mod diag;
pub mod driver;
pub mod layout;
pub mod resolve;
pub mod span;
pub mod unify;
pub mod value;

pub use driver::{
    AssembleError, AssembledModule, AssembledProgram, ModuleInput, ProgramOptions,
    assemble_module, assemble_program,
};
