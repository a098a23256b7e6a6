// 命令行程序的公共部分：日志初始化、参数错误、退出码

use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use tracing::error;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::unlock::UnlockError;

/// 命令行参数错误
pub const EXIT_ARGUMENT_ERROR: u8 = 1;
/// 领域错误（无法连接、超时、放弃、不支持、配置错误）
pub const EXIT_DOMAIN_ERROR: u8 = 2;
/// 其它错误
pub const EXIT_UNEXPECTED_ERROR: u8 = 3;

const LEVELS: [LevelFilter; 6] = [
    LevelFilter::OFF,
    LevelFilter::ERROR,
    LevelFilter::WARN,
    LevelFilter::INFO,
    LevelFilter::DEBUG,
    LevelFilter::TRACE,
];

/// 默认 INFO，每个 -v 提高一级，每个 -q 降低一级
pub fn verbosity_level(verbose: u8, quiet: u8) -> LevelFilter {
    let index = (3 + i32::from(verbose) - i32::from(quiet)).clamp(0, LEVELS.len() as i32 - 1);
    LEVELS[index as usize]
}

/// 初始化日志系统
/// 可以通过 RUST_LOG 环境变量控制各模块的日志级别
pub fn init_logging(verbose: u8, quiet: u8) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(verbosity_level(verbose, quiet).into()),
        )
        .with_target(false)
        .init();
}

/// 解析命令行；帮助与版本信息以 0 退出，参数错误以 1 退出
pub fn parse_arguments<T: Parser>() -> Result<T, ExitCode> {
    T::try_parse().map_err(|e| {
        let _ = e.print();
        match e.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
            _ => ExitCode::from(EXIT_ARGUMENT_ERROR),
        }
    })
}

/// 报告参数错误
pub fn argument_error<T: CommandFactory>(message: impl std::fmt::Display) -> ExitCode {
    let _ = T::command().error(ErrorKind::ArgumentConflict, message).print();
    ExitCode::from(EXIT_ARGUMENT_ERROR)
}

/// 错误对应的退出码
pub fn exit_code_for(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<UnlockError>() {
        Some(e) if e.is_domain() => EXIT_DOMAIN_ERROR,
        _ => EXIT_UNEXPECTED_ERROR,
    }
}

/// 记录错误并转换为退出码
pub fn report(result: anyhow::Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            if code == EXIT_DOMAIN_ERROR {
                error!("Aborting due to error: {}", e);
            } else {
                error!("Aborting due to unexpected error: {:?}", e);
            }
            ExitCode::from(code)
        }
    }
}
