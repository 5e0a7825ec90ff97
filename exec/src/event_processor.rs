use quarry_protocol::Event;

/// What the driver loop should do after an event has been rendered.
pub enum SessionStatus {
    Running,
    Shutdown,
}

pub trait EventProcessor {
    fn process_event(&mut self, event: &Event) -> SessionStatus;
}
