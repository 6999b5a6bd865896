use std::process::ExitCode;

fn main() -> ExitCode {
    hle_kernel::run_cli()
}
