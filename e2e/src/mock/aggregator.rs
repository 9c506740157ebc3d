/// What a mock backend accumulates while it runs
pub trait Aggregator {
    fn new() -> Self;
    fn add_request(&mut self);
    fn add_response(&mut self);
}

#[derive(Debug, Clone, Default)]
pub struct SimpleAggregator {
    pub requests_received: usize,
    pub responses_sent: usize,
    /// every byte read, all connections mixed
    pub received: Vec<u8>,
}

impl Aggregator for SimpleAggregator {
    fn new() -> Self {
        Default::default()
    }

    fn add_request(&mut self) {
        self.requests_received += 1;
    }

    fn add_response(&mut self) {
        self.responses_sent += 1;
    }
}
