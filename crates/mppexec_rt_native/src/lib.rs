pub mod runtime;

pub use runtime::NativeExecutionRuntime;
