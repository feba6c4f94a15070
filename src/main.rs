fn main() {
    if let Err(err) = study_etl::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
