// Throughput accounting shared by peer sessions and the torrent's choke
// pass. Counters accumulate within a round (one session tick) and fold into
// a moving average on reset.

#[derive(Debug, Default, Clone, Copy)]
pub struct ThroughputStats {

    pub up: Counter,

    pub down: Counter,

}

impl ThroughputStats {
    pub fn reset(&mut self) {
        self.up.reset();
        self.down.reset();
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Counter {
    total: u64,
    round: u64,
    avg: f64,
    peak: f64,
}

impl Counter {

    pub fn add(&mut self, n: u64) {
        self.total += n;
        self.round += n;
    }

    pub fn reset(&mut self) {
        self.avg = (self.avg * (5 - 1) as f64 / 5.0) + (self.round as f64 / 5.0);
        self.round = 0;
        if self.avg > self.peak {
            self.peak = self.avg;
        }
    }

    pub fn avg(&self) -> u64 {
        self.avg as u64
    }

    pub fn peak(&self) -> u64 {
        self.peak as u64
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn round(&self) -> u64 {
        self.round
    }
}

impl std::ops::AddAssign<u64> for Counter {
    fn add_assign(&mut self, n: u64) {
        self.add(n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_round_and_total() {
        let mut c = Counter::default();
        c += 100;
        c += 50;
        assert_eq!(c.round(), 150);
        assert_eq!(c.total(), 150);

        c.reset();
        assert_eq!(c.round(), 0);
        assert_eq!(c.total(), 150);
        assert_eq!(c.avg(), 30);

        c += 10;
        assert_eq!(c.total(), 160);
    }
}
