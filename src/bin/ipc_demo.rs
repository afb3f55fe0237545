// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Interactive harness for the IPC patterns.
//
// Usage: ipc_demo   (run one instance per role, in separate terminals)
//
// Each menu item drives one pattern with fixed ids so that two instances
// of this binary rendezvous without any configuration.

use std::io::{self, BufRead, Write};
use std::thread;
use std::time::Duration;

use crossipc::{DispenserMode, PipeDispenser, PubSub, ReqResp, SharedRegion, ShmDispenser, StoreDict};

fn prompt(text: &str) -> String {
    print!("{text}");
    io::stdout().flush().ok();
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line).ok();
    line.trim().to_string()
}

fn wait_for_enter(text: &str) {
    let _ = prompt(text);
}

fn main() {
    env_logger::init();

    println!("Choose IPC pattern:");
    println!("1. Store Dictionary Pattern");
    println!("2. Pub/Sub Pattern");
    println!("3. Request-Response Pattern");
    println!("4. Dispenser Pattern (Named Pipes)");
    println!("5. Dispenser Pattern (Shared Memory)");
    println!("6. Shared Memory Synchronization Test");

    match prompt("Enter your choice (1-6): ").as_str() {
        "1" => {
            if prompt("Enter 's' to send or any other key to receive: ") == "s" {
                store_dict_sender();
            } else {
                store_dict_receiver();
            }
        }
        "2" => {
            if prompt("Enter 'p' to publish or any other key to subscribe: ") == "p" {
                pubsub_publisher();
            } else {
                pubsub_subscriber();
            }
        }
        "3" => {
            if prompt("Enter 's' to serve or any other key to request: ") == "s" {
                reqresp_server();
            } else {
                reqresp_client();
            }
        }
        "4" => {
            if prompt("Enter 'p' to provide or any other key to consume: ") == "p" {
                pipe_dispenser_provider();
            } else {
                pipe_dispenser_consumer();
            }
        }
        "5" => {
            if prompt("Enter 'p' to provide or any other key to consume: ") == "p" {
                shm_dispenser_provider();
            } else {
                shm_dispenser_consumer();
            }
        }
        "6" => shared_memory_sync_test(),
        _ => println!("Invalid choice"),
    }
}

// ---------------------------------------------------------------------------
// 1. StoreDict
// ---------------------------------------------------------------------------

fn store_dict_sender() {
    println!("Setting up StoreDict with id 'MySharedDict'");
    let mut store = StoreDict::new("MySharedDict", 4096).expect("store dict");
    if !store.setup().expect("setup") {
        println!("Could not acquire the store mutex.");
        return;
    }

    store.store_string("greeting", "Hello").expect("store");
    store.store_string("number", "12345").expect("store");
    store.store_string("status", "ready").expect("store");
    println!("Stored 3 key-value pairs in the dictionary.");

    println!("Dictionary contains {} keys:", store.len());
    for key in store.list_keys() {
        if let Ok(Some(value)) = store.retrieve_string(&key) {
            println!("  {key}: {value}");
        }
    }

    println!();
    println!("=================================================");
    println!("IMPORTANT: KEEP THIS WINDOW OPEN!");
    println!("The shared region lives in {:?}.", std::env::temp_dir());
    println!("Start the receiver now, then press Enter here when done.");
    println!("=================================================");
    println!();
    wait_for_enter("");

    store.load();
    match store.retrieve_string("response") {
        Ok(Some(response)) => println!("Receiver responded: {response}"),
        _ => println!("No response from a receiver."),
    }
    store.close();
}

fn store_dict_receiver() {
    println!("Waiting for the sender to create the dictionary...");
    wait_for_enter("Press Enter when the sender is running... ");

    println!("Setting up StoreDict with id 'MySharedDict'");
    let mut store = StoreDict::new("MySharedDict", 4096).expect("store dict");
    if !store.setup().expect("setup") {
        println!("Could not acquire the store mutex.");
        return;
    }

    println!("Dictionary contains {} keys:", store.len());
    for key in store.list_keys() {
        if let Ok(Some(value)) = store.retrieve_string(&key) {
            println!("  {key}: {value}");
        }
    }

    println!("Adding a new key 'response'...");
    store.store_string("response", "Hi").expect("store");

    match store.retrieve_string("greeting") {
        Ok(Some(greeting)) => println!("Retrieved greeting: {greeting}"),
        _ => println!("Failed to retrieve greeting."),
    }

    wait_for_enter("Press Enter to exit... ");
    store.close();
}

// ---------------------------------------------------------------------------
// 2. PubSub
// ---------------------------------------------------------------------------

fn pubsub_publisher() {
    let mut pubsub = PubSub::new("MyPubSub", 4096).expect("pubsub");
    pubsub.setup().expect("setup");
    pubsub.create_topic("news").expect("create topic");

    println!("Publishing to topic 'news'. Empty line quits.");
    loop {
        let line = prompt("> ");
        if line.is_empty() {
            break;
        }
        match pubsub.publish_string("news", &line) {
            Ok(true) => {}
            _ => println!("Publish failed."),
        }
    }
    pubsub.close();
}

fn pubsub_subscriber() {
    let mut pubsub = PubSub::new("MyPubSub", 4096).expect("pubsub");
    pubsub.setup().expect("setup");

    pubsub.subscribe("news", |topic, payload| {
        let printable = payload.iter().all(|&b| b == 0 || (32..127).contains(&b));
        if printable {
            let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
            println!(
                "Received message on topic '{topic}': {}",
                String::from_utf8_lossy(&payload[..end])
            );
        } else {
            println!(
                "Received message on topic '{topic}': (binary data, {} bytes)",
                payload.len()
            );
        }
    });

    println!("Subscribed to topic 'news'.");
    wait_for_enter("Press Enter to stop listening... ");
    pubsub.close();
}

// ---------------------------------------------------------------------------
// 3. Request-Response
// ---------------------------------------------------------------------------

fn reqresp_server() {
    let mut rr = ReqResp::new();

    rr.respond("echo", |request| {
        println!("Server received request: {request}");
        format!("Echo from server: {request}")
    })
    .expect("respond echo");

    rr.respond("calc", |request| {
        println!("Calculator received request: {request}");
        calculate(request)
    })
    .expect("respond calc");

    println!("Serving 'echo' and 'calc'.");
    wait_for_enter("Press Enter to stop the server... ");
    rr.close();
}

fn calculate(request: &str) -> String {
    let parts: Vec<&str> = request.split_whitespace().collect();
    let [op, a, b] = parts.as_slice() else {
        return "Error: Invalid format. Use 'operation num1 num2'".to_string();
    };
    let (Ok(a), Ok(b)) = (a.parse::<f64>(), b.parse::<f64>()) else {
        return "Error: Invalid format. Use 'operation num1 num2'".to_string();
    };
    let result = match *op {
        "add" => a + b,
        "subtract" => a - b,
        "multiply" => a * b,
        "divide" => {
            if b == 0.0 {
                return "Error: Division by zero".to_string();
            }
            a / b
        }
        _ => return "Error: Unknown operation. Use add, subtract, multiply, or divide".to_string(),
    };
    format!("Result: {result:.2}")
}

fn reqresp_client() {
    let mut rr = ReqResp::new();
    let id = if prompt("Enter 'c' for the calculator or any other key for echo: ") == "c" {
        "calc"
    } else {
        "echo"
    };
    rr.setup_client(id).expect("connect");

    println!("Connected to '{id}'. Empty line quits.");
    loop {
        let line = prompt("> ");
        if line.is_empty() {
            break;
        }
        match rr.request(id, &line) {
            Ok(Some(reply)) => println!("{reply}"),
            Ok(None) => {
                println!("Server closed the connection.");
                break;
            }
            Err(e) => {
                println!("Request failed: {e}");
                break;
            }
        }
    }
    rr.close();
}

// ---------------------------------------------------------------------------
// 4. Pipe dispenser
// ---------------------------------------------------------------------------

fn pipe_dispenser_provider() {
    let mut dispenser = PipeDispenser::new("PD1", DispenserMode::Fifo);
    dispenser.setup_provider().expect("setup provider");

    println!("Pipe dispenser 'PD1' is serving (FIFO).");
    println!("Type items to add; empty line quits.");
    loop {
        let line = prompt("> ");
        if line.is_empty() {
            break;
        }
        dispenser.add_string(&line).expect("add");
    }
    dispenser.close();
}

fn pipe_dispenser_consumer() {
    let mut dispenser = PipeDispenser::new("PD1", DispenserMode::Fifo);
    dispenser.setup_consumer().expect("connect");

    println!("Connected to pipe dispenser 'PD1'. Press Enter to dispense, 'q' quits.");
    loop {
        if prompt("") == "q" {
            break;
        }
        match dispenser.dispense_string() {
            Ok(Some(item)) => println!("Dispensed: {item}"),
            Ok(None) => println!("Dispenser is empty."),
            Err(e) => {
                println!("Dispense failed: {e}");
                break;
            }
        }
    }
    dispenser.close();
}

// ---------------------------------------------------------------------------
// 5. Shared-memory dispenser
// ---------------------------------------------------------------------------

fn shm_dispenser_provider() {
    let mut dispenser = ShmDispenser::new("D1", DispenserMode::Fifo);
    dispenser.setup(16, 256).expect("setup");
    println!(
        "Shared-memory dispenser 'D1' ready ({}).",
        if dispenser.is_provider() {
            "created"
        } else {
            "joined existing"
        }
    );

    println!("Type items to add; empty line quits.");
    loop {
        let line = prompt("> ");
        if line.is_empty() {
            break;
        }
        match dispenser.add_string(&line) {
            Ok(true) => {}
            Ok(false) => println!("Add failed (full, or item too large)."),
            Err(e) => {
                println!("Add failed: {e}");
                break;
            }
        }
    }
    dispenser.close();
}

fn shm_dispenser_consumer() {
    let mut dispenser = ShmDispenser::new("D1", DispenserMode::Fifo);
    if let Err(e) = dispenser.setup(0, 0) {
        println!("No dispenser 'D1' to join ({e}). Start the provider first.");
        return;
    }

    println!("Joined dispenser 'D1'. Press Enter to dispense, 'q' quits.");
    loop {
        if prompt("") == "q" {
            break;
        }
        match dispenser.dispense_string() {
            Ok(Some(item)) => println!("Dispensed: {item}"),
            Ok(None) => println!("Dispenser is empty (waited 1 s)."),
            Err(e) => {
                println!("Dispense failed: {e}");
                break;
            }
        }
    }
    dispenser.close();
}

// ---------------------------------------------------------------------------
// 6. Shared-memory synchronization test
// ---------------------------------------------------------------------------

/// Two instances race on one counter; the advisory lock keeps every
/// increment intact.
fn shared_memory_sync_test() {
    let mut region = SharedRegion::new("SyncCounter", 64);
    region.setup().expect("setup");

    println!("Incrementing the shared counter 20 times under the write lock.");
    for _ in 0..20 {
        if !region.lock_for_writing(2_000).expect("lock") {
            println!("Lock timed out; skipping this round.");
            continue;
        }
        let bytes = region.read().expect("read");
        let counter = u32::from_le_bytes(bytes[..4].try_into().unwrap());
        let next = counter + 1;
        region.write(&next.to_le_bytes()).expect("write");
        region.unlock_from_writing();
        println!("counter: {counter} -> {next}");
        thread::sleep(Duration::from_millis(100));
    }

    let bytes = region.read().expect("read");
    println!(
        "Final counter value: {}",
        u32::from_le_bytes(bytes[..4].try_into().unwrap())
    );
    region.close();
}
