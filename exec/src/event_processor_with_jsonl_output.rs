//! JSONL output mode: one event per line on stdout, nothing else.

use quarry_protocol::Event;
use quarry_protocol::EventMsg;
use tracing::error;

use crate::event_processor::EventProcessor;
use crate::event_processor::SessionStatus;

#[derive(Default)]
pub struct EventProcessorWithJsonOutput {}

impl EventProcessorWithJsonOutput {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventProcessor for EventProcessorWithJsonOutput {
    #[allow(clippy::print_stdout)]
    fn process_event(&mut self, event: &Event) -> SessionStatus {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(err) => error!("failed to serialize event {}: {err}", event.id),
        }
        match &event.msg {
            EventMsg::AnalysisComplete(_) => SessionStatus::Shutdown,
            _ => SessionStatus::Running,
        }
    }
}
