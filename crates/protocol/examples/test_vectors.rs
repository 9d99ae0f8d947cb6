//! Generate event frame vectors for frontend interop testing.
//!
//! Run with: cargo run --package protocol --example test_vectors

use protocol::{Event, EventFrame, Heartbeat, OutputEvent, StatusPayload};

fn main() {
    print_test_vector("statusStarting", &Event::Status(StatusPayload::Starting));
    print_test_vector(
        "statusRunning",
        &Event::Status(StatusPayload::Running { pid: Some(4242) }),
    );
    print_test_vector("statusStopped", &Event::Status(StatusPayload::Stopped));
    print_test_vector(
        "statusError",
        &Event::Status(StatusPayload::Error {
            message: "claude command not found".to_string(),
        }),
    );

    print_test_vector("outputText", &Event::Output(OutputEvent::text("abcdone")));
    print_test_vector(
        "outputError",
        &Event::Output(OutputEvent::error("permission denied")),
    );
    print_test_vector(
        "outputComplete",
        &Event::Output(OutputEvent::complete(Some(2))),
    );

    print_test_vector("commandSent", &Event::command_sent("/help"));
    print_test_vector("heartbeat", &Event::Heartbeat(Heartbeat::now()));
}

fn print_test_vector(name: &str, event: &Event) {
    let frame: EventFrame = event.to_frame().expect("serialization failed");
    let json = serde_json::to_string(&frame).expect("serialization failed");
    println!("export const {} = {};", name, json);
}
