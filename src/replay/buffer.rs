//! Per-(security, base-data-type) replay buffer (§3, §4.5) and the
//! batch-aggregation rules the scheduler applies when it drains one.

use std::collections::VecDeque;

use crate::collaborators::{BaseDataType, HistoricalTick};
use crate::wire::{QuotePayload, TradeEvent, TradePayload};

/// Ordered queue of future ticks for one (security, base-data-type) pair,
/// plus the channel-type suffixes fed from this buffer and a refill flag
/// (§3). Destroyed once `channel_types` is empty.
pub struct ReplayBuffer {
    pub security_id: i64,
    pub base_type: BaseDataType,
    pub queue: VecDeque<HistoricalTick>,
    pub channel_types: Vec<String>,
    pub refilling: bool,
}

impl ReplayBuffer {
    pub fn new(security_id: i64, base_type: BaseDataType) -> Self {
        Self {
            security_id,
            base_type,
            queue: VecDeque::new(),
            channel_types: Vec::new(),
            refilling: false,
        }
    }

    /// Appends ticks in ascending order, maintaining the sorted invariant
    /// required by §8 ("B.queue is sorted ascending by timestamp").
    pub fn extend_ascending(&mut self, ticks: impl IntoIterator<Item = HistoricalTick>) {
        for t in ticks {
            self.queue.push_back(t);
        }
    }

    /// Drains every tick with `timestamp_ms <= sim_time` from the front.
    pub fn drain_due(&mut self, sim_time_ms: i64) -> Vec<HistoricalTick> {
        let mut drained = Vec::new();
        while let Some(front) = self.queue.front() {
            if front.timestamp_ms() > sim_time_ms {
                break;
            }
            drained.push(self.queue.pop_front().unwrap());
        }
        drained
    }

    /// Milliseconds of look-ahead remaining past `sim_time`, or `None` if
    /// the buffer is empty (caller should treat that as "needs refill").
    pub fn lookahead_ms(&self, sim_time_ms: i64) -> Option<i64> {
        self.queue.back().map(|t| t.timestamp_ms() - sim_time_ms)
    }
}

/// Aggregates a drained batch of trades into one (§4.5): last valid price
/// (last tick with `price >= 0`), summed size, union of conditions,
/// timestamp/exchange_id/channel from the last trade.
pub fn aggregate_trades(batch: &[TradeEvent], channel: &str) -> Option<TradePayload> {
    let last = batch.last()?;
    let last_valid_price = batch
        .iter()
        .rev()
        .find(|t| t.price >= 0.0)
        .map(|t| t.price)
        .unwrap_or(last.price);
    let size: i64 = batch.iter().map(|t| t.size).sum();
    let mut conditions: Vec<i32> = Vec::new();
    for t in batch {
        for c in &t.conditions {
            if !conditions.contains(c) {
                conditions.push(*c);
            }
        }
    }

    Some(TradePayload {
        channel: channel.to_string(),
        price: last_valid_price,
        size,
        timestamp_ms: last.timestamp_ms,
        exchange_id: last.exchange_id,
        conditions,
        should_update_price: true,
    })
}

/// A quote batch aggregates to its last element (§4.5).
pub fn aggregate_quotes(
    batch: &[crate::wire::QuoteEvent],
    channel: &str,
) -> Option<QuotePayload> {
    let last = batch.last()?;
    Some(QuotePayload {
        channel: channel.to_string(),
        bid_price: last.bid_price,
        ask_price: last.ask_price,
        bid_size: last.bid_size,
        ask_size: last.ask_size,
        timestamp_ms: last.timestamp_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(ts: i64, price: f64, size: i64, conds: &[i32]) -> TradeEvent {
        TradeEvent {
            ticker: "AAPL".to_string(),
            price,
            size,
            timestamp_ms: ts,
            exchange_id: 1,
            conditions: conds.to_vec(),
        }
    }

    #[test]
    fn drain_due_respects_ascending_order_and_boundary() {
        let mut buf = ReplayBuffer::new(7, BaseDataType::Trade);
        buf.extend_ascending([
            HistoricalTick::Trade(trade(100, 1.0, 1, &[])),
            HistoricalTick::Trade(trade(200, 2.0, 1, &[])),
            HistoricalTick::Trade(trade(300, 3.0, 1, &[])),
        ]);

        let drained = buf.drain_due(200);
        assert_eq!(drained.len(), 2);
        assert_eq!(buf.queue.len(), 1);
    }

    #[test]
    fn aggregate_trades_sums_size_and_unions_conditions() {
        let batch = vec![
            trade(100, 190.0, 100, &[1]),
            trade(200, 190.5, 200, &[1, 2]),
            trade(300, 190.2, 50, &[]),
        ];
        let agg = aggregate_trades(&batch, "7-fast-regular").unwrap();
        assert_eq!(agg.size, 350);
        assert_eq!(agg.price, 190.2);
        assert_eq!(agg.timestamp_ms, 300);
        assert_eq!(agg.conditions, vec![1, 2]);
    }

    #[test]
    fn aggregate_trades_skips_negative_price_for_last_valid() {
        let batch = vec![trade(100, 190.0, 100, &[]), trade(200, -1.0, 50, &[])];
        let agg = aggregate_trades(&batch, "7-fast-regular").unwrap();
        assert_eq!(agg.price, 190.0);
        assert_eq!(agg.timestamp_ms, 200); // timestamp still from the last tick
    }
}
