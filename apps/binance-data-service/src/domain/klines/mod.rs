//! Historical Kline Trimming
//!
//! `GetKlines` asks the exchange for one bar more than the client wants.
//! The extra bar is either the candle still forming at the tail or, when
//! the tail has already closed, the boundary bar at the head. Exactly one
//! of the two is dropped.

/// Kline row as returned by the exchange, with the one field the trim
/// rule needs pulled out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBar {
    /// The row verbatim, as a JSON array.
    pub raw: String,
    /// Close time in epoch milliseconds (row index 6).
    pub close_time: i64,
}

/// Which bar the trim removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimmedEdge {
    /// The last bar had not closed yet.
    FormingTail,
    /// The last bar had closed, so the oldest bar was the extra one.
    OldestHead,
    /// Nothing was returned.
    Nothing,
}

/// Result of trimming a kline response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrimmedBars {
    /// Bars to return, oldest first.
    pub bars: Vec<RawBar>,
    /// Which edge was removed.
    pub edge: TrimmedEdge,
}

/// Drop the forming tail bar or the oldest head bar.
///
/// `corrected_now_ms` is local time plus the clock offset, so it is
/// comparable with exchange close times.
#[must_use]
pub fn trim_bars(mut bars: Vec<RawBar>, corrected_now_ms: i64) -> TrimmedBars {
    let Some(last) = bars.last() else {
        return TrimmedBars {
            bars,
            edge: TrimmedEdge::Nothing,
        };
    };

    let edge = if last.close_time > corrected_now_ms {
        bars.pop();
        TrimmedEdge::FormingTail
    } else {
        bars.remove(0);
        TrimmedEdge::OldestHead
    };

    TrimmedBars { bars, edge }
}
