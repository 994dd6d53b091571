// Running a job's functions in sequence or in parallel

use crate::invocation::FunctionRunner;
use crate::models::{ExecutionType, FunctionCallResult, FunctionInvocationSpec};
use futures::future::join_all;

/// Run functions and collect one result per call.
///
/// Sequential runs stop after the first failing call, so their results are
/// a prefix of `functions`. Parallel runs wait for every call and keep the
/// input order.
pub async fn run_functions(
    runner: &FunctionRunner,
    functions: &[FunctionInvocationSpec],
    execution_type: ExecutionType,
) -> Vec<FunctionCallResult> {
    match execution_type {
        ExecutionType::Sequential => {
            let mut results = Vec::with_capacity(functions.len());
            for spec in functions {
                let result = runner.call(spec).await;
                let halt = result.is_failure();
                results.push(result);
                if halt {
                    break;
                }
            }
            results
        }
        ExecutionType::Parallel => join_all(functions.iter().map(|spec| runner.call(spec))).await,
    }
}
