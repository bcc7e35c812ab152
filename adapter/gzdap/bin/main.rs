use clap::{value_parser, Arg, Command};

fn main() {
    let matches = Command::new("gzdap")
        .about("Debug adapter proxy for the GZDoom DAP server")
        .arg(
            Arg::new("port")
                .long("port")
                .value_parser(value_parser!(u16))
                .help("Listen for the DAP client on this port instead of using stdio"),
        )
        .arg(
            Arg::new("connect")
                .long("connect")
                .value_parser(value_parser!(u16))
                .help("Connect out to a DAP client listening on this port"),
        )
        .arg(
            Arg::new("settings")
                .long("settings")
                .help("Proxy configuration as a JSON object"),
        )
        .get_matches();

    match gzdap::debug_server(&matches) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            match err.downcast::<gzdap::BlamedError>() {
                Ok(blamed) => match blamed.blame {
                    gzdap::Blame::User => eprintln!("{}", blamed.inner),
                    gzdap::Blame::Internal => eprintln!("Internal error: {}", blamed.inner),
                },
                Err(err) => eprintln!("{}", err),
            }
            std::process::exit(1);
        }
    }
}
