use crate::measure::PipelineError;

pub fn clang_path() -> Option<String> {
    match std::env::var("CLANG") {
        Ok(v) => Some(v),
        Err(_) => None,
    }
}

pub(crate) fn compiler_path() -> Result<String, PipelineError> {
    clang_path().ok_or_else(|| {
        PipelineError::TargetUnreachable("CLANG environment variable is not set".to_string())
    })
}
