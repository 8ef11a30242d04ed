use std::io::{Read, Write};
use std::thread;

use stcp::loopback::{self, Endpoint};
use stcp::{run, Config, PortPair};

fn main() {
    let (client, server) = loopback::pair();

    let Endpoint {
        chan: client_chan,
        app: mut client_app,
    } = client;
    let Endpoint {
        chan: server_chan,
        app: mut server_app,
    } = server;

    let client_engine = thread::spawn(move || {
        run(
            client_chan,
            Config::active(PortPair {
                local: 34343,
                remote: 9090,
            }),
        )
    });
    let server_engine = thread::spawn(move || {
        run(
            server_chan,
            Config::passive(PortPair {
                local: 9090,
                remote: 34343,
            }),
        )
    });

    let echo = thread::spawn(move || {
        server_app.wait_open().unwrap();
        println!(">>> Connection accepted");

        loop {
            let mut buf = [0u8; 1500];
            let n = server_app.read(&mut buf[..]).unwrap();

            if n == 0 {
                break;
            }

            let upper: Vec<u8> = buf[..n].iter().map(u8::to_ascii_uppercase).collect();
            server_app.write_all(&upper).unwrap();
        }

        server_app.close();
    });

    println!(">>> Trying to connect to server...");
    client_app.wait_open().unwrap();
    println!(">>> Connected!");

    client_app.write_all(b"hello, stcp").unwrap();

    let mut buf = [0u8; 1500];
    let mut echoed = Vec::new();
    while echoed.len() < b"hello, stcp".len() {
        let n = client_app.read(&mut buf[..]).unwrap();
        echoed.extend_from_slice(&buf[..n]);
    }

    println!(
        ">>> Read: {:?}",
        String::from_iter(echoed.iter().map(|c| *c as char))
    );

    println!(">>> Closing (this waits out the 2-MSL linger)...");
    client_app.close();

    echo.join().unwrap();
    client_engine.join().unwrap().unwrap();
    server_engine.join().unwrap().unwrap();
    println!(">>> Both endpoints released");
}
