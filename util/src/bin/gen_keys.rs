use clap::{App, Arg};
use magnetite::crypto;
use std::fs;

fn main() {
    let matches = App::new("Key Generator")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Generates a server box keypair for the overlay.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Write a JSON server config stub to this path")
                .required(false),
        )
        .get_matches();

    crypto::init();

    let (public_key, private_key) = crypto::generate_keypair();

    let public_b64 = base64::encode(&public_key[..]);
    let private_b64 = base64::encode(&private_key[..]);

    println!("public_key:  {}", public_b64);
    println!("private_key: {}", private_b64);

    if let Some(path) = matches.value_of("CONFIG_FILE") {
        let config = format!(
            "{{\n  \"max_sessions\": 256,\n  \"session_timeout_secs\": 10.0,\n  \"public_key\": \"{}\",\n  \"private_key\": \"{}\"\n}}\n",
            public_b64, private_b64
        );

        fs::write(path, config).expect("Error writing config file");

        println!("Wrote config stub to `{}`", path);
    }
}
