//! Simulate a two-tab journey and print what the edge archives

use std::rc::Rc;

use fullscore::clock::ManualClock;
use fullscore::config::FullScoreConfig;
use fullscore::edge::{handle, EdgeRequest};
use fullscore::rhythm::{Environment, MemoryCookieJar, MemoryHost, RecordingTransport, Rhythm};
use fullscore::ActionTarget;

fn main() {
    let mut config = FullScoreConfig::default();
    config.beat.actions.insert("#buy".to_string(), "buy".to_string());

    let jar = MemoryCookieJar::new();
    let transport = RecordingTransport::new();
    let clock = ManualClock::new(1_735_680_000_000);
    let env = |host: &MemoryHost| Environment {
        store: Rc::new(jar.clone()),
        host: Rc::new(host.clone()),
        transport: Rc::new(transport.clone()),
        clock: Rc::new(clock.clone()),
    };

    let home = MemoryHost::new("shop.example", "/");
    let mut first = Rhythm::start(&config, env(&home));
    clock.advance(2_300);
    first.click(&ActionTarget::new("a", 3, 1).with_href("/pricing"));

    clock.advance(1_500);
    let about = home.open_tab("/about");
    let mut second = Rhythm::start(&config, env(&about));
    clock.advance(4_000);
    second.click(&ActionTarget::new("button", 4, 1).with_id("buy"));

    clock.advance(6_000);
    first.click(&ActionTarget::new("button", 4, 1).with_id("buy"));
    println!("cookies: {}", jar.header());

    // Closing both tabs flushes the batch to the echo endpoint
    for tab in [&mut second, &mut first] {
        if let Some(check) = tab.page_hide(false) {
            tab.settle(check);
        }
    }

    for (url, body) in transport.beacons() {
        println!("beacon {url}: {body}");
        let request = EdgeRequest::new("POST", &config.edge.echo_path).with_body(&body);
        match handle(&request, &config.edge) {
            Ok(response) => println!("edge: {response:?}"),
            Err(e) => eprintln!("Error: {e:?}"),
        }
    }
}
