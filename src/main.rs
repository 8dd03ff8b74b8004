fn main() {
    if let Err(error) = dungeon_tracker_lib::run() {
        eprintln!("{error}");
        std::process::exit(1);
    }
}
