fn main() {
    if let Err(err) = csv_xml_mapper::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
