use clap::Parser;

fn main() {
    let cli = sgrabctl::Cli::parse();
    match sgrabctl::run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    }
}
