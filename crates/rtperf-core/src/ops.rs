//! Table of generic engine operations.
//!
//! Every operation the engine exports (other than the lifecycle calls
//! `start`, `stop` and `reset`, which have dedicated methods on
//! [`Performance`]) is listed once in the `engine_ops!` invocation below.
//! The macro produces the [`EngineOp`] identifier, its wire name, arity and
//! dispatch class, and one typed wrapper method on [`Performance`].

use crate::error::Result;
use crate::performance::Performance;
use crate::value::Value;
use std::collections::HashMap;

/// How a generic call is dispatched while a performance is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Waits for the render thread's cycle boundary before dispatching
    /// while a performance or render is active; dropped after it ended.
    Guarded,
    /// Always dispatched immediately.
    Direct,
}

macro_rules! engine_ops {
    ($(
        $(#[$doc:meta])*
        $variant:ident => $name:literal, $dispatch:ident, fn $method:ident($($arg:ident: $ty:ty),*);
    )*) => {
        /// Identifier of a generic engine operation.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum EngineOp {
            $($variant),*
        }

        impl EngineOp {
            /// Every operation, in table order.
            pub const ALL: &'static [EngineOp] = &[$(EngineOp::$variant),*];

            /// Wire name of the operation.
            pub fn name(self) -> &'static str {
                match self {
                    $(EngineOp::$variant => $name),*
                }
            }

            /// Number of arguments the operation takes.
            pub fn arity(self) -> usize {
                match self {
                    $(EngineOp::$variant => 0 $(+ { let _ = stringify!($arg); 1 })*),*
                }
            }

            /// Parameter names, for help output.
            pub fn params(self) -> &'static [&'static str] {
                match self {
                    $(EngineOp::$variant => &[$(stringify!($arg)),*]),*
                }
            }

            pub fn dispatch(self) -> Dispatch {
                match self {
                    $(EngineOp::$variant => Dispatch::$dispatch),*
                }
            }
        }

        impl Performance {
            $(
                $(#[$doc])*
                pub fn $method(&self, $($arg: $ty),*) -> Result<Option<Value>> {
                    self.invoke(EngineOp::$variant, vec![$(Value::from($arg)),*])
                }
            )*
        }
    };
}

engine_ops! {
    /// Compile a complete CSD document.
    CompileCsd => "compileCsd", Guarded, fn compile_csd(csd: &str);
    /// Compile orchestra code.
    CompileOrc => "compileOrc", Guarded, fn compile_orc(orc: &str);
    /// Evaluate orchestra code, returning its value.
    EvalCode => "evalCode", Guarded, fn eval_code(code: &str);
    ReadScore => "readScore", Guarded, fn read_score(score: &str);
    InputMessage => "inputMessage", Guarded, fn input_message(message: &str);
    /// Set an engine option (`-r44100`, `--nchnls=2`, `-odac`, ...).
    SetOption => "setOption", Guarded, fn set_option(option: &str);
    GetSr => "getSr", Guarded, fn get_sr();
    GetKsmps => "getKsmps", Guarded, fn get_ksmps();
    GetNchnls => "getNchnls", Guarded, fn get_nchnls();
    GetNchnlsInput => "getNchnlsInput", Guarded, fn get_nchnls_input();
    Get0dBFS => "get0dBFS", Guarded, fn get_0dbfs();
    GetControlChannel => "getControlChannel", Guarded, fn get_control_channel(name: &str);
    SetControlChannel => "setControlChannel", Guarded,
        fn set_control_channel(name: &str, value: f64);
    GetStringChannel => "getStringChannel", Guarded, fn get_string_channel(name: &str);
    SetStringChannel => "setStringChannel", Guarded, fn set_string_channel(name: &str, value: &str);
    /// Seconds of score time performed so far.
    GetScoreTime => "getScoreTime", Guarded, fn get_score_time();
    IsScorePending => "isScorePending", Guarded, fn is_score_pending();
    SetScorePending => "setScorePending", Guarded, fn set_score_pending(pending: i64);
    RewindScore => "rewindScore", Guarded, fn rewind_score();
    GetScoreOffsetSeconds => "getScoreOffsetSeconds", Guarded, fn get_score_offset_seconds();
    SetScoreOffsetSeconds => "setScoreOffsetSeconds", Guarded,
        fn set_score_offset_seconds(offset: f64);
    TableLength => "tableLength", Guarded, fn table_length(table: i64);
    TableGet => "tableGet", Guarded, fn table_get(table: i64, index: i64);
    TableSet => "tableSet", Guarded, fn table_set(table: i64, index: i64, value: f64);
    GetVersion => "getVersion", Guarded, fn get_version();
    GetApiVersion => "getAPIVersion", Guarded, fn get_api_version();
    /// Write a file into the engine's file system.
    WriteToFs => "writeToFs", Direct, fn write_to_fs(path: &str, data: &[u8]);
    ReadFromFs => "readFromFs", Direct, fn read_from_fs(path: &str);
    /// List the engine's file system.
    LsFs => "lsFs", Direct, fn ls_fs();
    /// Long listing of the engine's file system: `[path, size]` pairs.
    LlFs => "llFs", Direct, fn ll_fs();
    RmrfFs => "rmrfFs", Direct, fn rmrf_fs(path: &str);
}

/// Name-to-operation index, built once when a performance is initialized.
#[derive(Debug, Clone)]
pub struct OperationTable {
    by_name: HashMap<&'static str, EngineOp>,
}

impl OperationTable {
    /// Index every entry of [`EngineOp::ALL`].
    pub fn build() -> Self {
        let by_name = EngineOp::ALL.iter().map(|op| (op.name(), *op)).collect();
        Self { by_name }
    }

    pub fn lookup(&self, name: &str) -> Option<EngineOp> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Operations in table order.
    pub fn iter(&self) -> impl Iterator<Item = EngineOp> + '_ {
        EngineOp::ALL.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_unique() {
        let table = OperationTable::build();
        assert_eq!(table.len(), EngineOp::ALL.len());
    }

    #[test]
    fn test_lookup_and_arity() {
        let table = OperationTable::build();
        let op = table.lookup("tableSet").unwrap();
        assert_eq!(op, EngineOp::TableSet);
        assert_eq!(op.arity(), 3);
        assert_eq!(op.params(), &["table", "index", "value"]);
        assert_eq!(EngineOp::GetSr.arity(), 0);
        assert!(table.lookup("start").is_none());
    }

    #[test]
    fn test_file_system_calls_are_direct() {
        assert_eq!(EngineOp::ReadFromFs.dispatch(), Dispatch::Direct);
        assert_eq!(EngineOp::LsFs.dispatch(), Dispatch::Direct);
        assert_eq!(EngineOp::LlFs.dispatch(), Dispatch::Direct);
        assert_eq!(EngineOp::CompileOrc.dispatch(), Dispatch::Guarded);
    }
}
