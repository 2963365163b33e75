use clap::Parser;

fn main() {
    let cli = grazing_pipeline_cli::Cli::parse();
    match grazing_pipeline_cli::run_cli(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(grazing_pipeline_cli::exit_code_for(&err));
        }
    }
}
