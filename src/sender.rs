use std::io::{self, Write};

use crate::client::{PutClient, SendError};
use crate::forwarder::UdpForwarder;
use crate::point::{DataPoint, TagMap};
use crate::sanitize::Sanitizer;

/// The closed set of delivery modes, selected at configuration time.
///
/// Each variant ships a batch through a single [`send`](Self::send) entry
/// point, with failure semantics that differ per variant: UDP forwarding is
/// best-effort and never fails the caller, while HTTP surfaces every error.
pub enum Sender {
    /// Discards every batch.
    Noop,

    /// Writes each point's line-protocol text to stdout. Useful when wiring
    /// up a collector before a backend exists.
    Console {
        /// Tags merged into every point, overriding same-named point tags.
        global_tags: TagMap,
    },

    /// Forwards to a local collector daemon over UDP, fire-and-forget.
    Udp(UdpForwarder),

    /// Ships to the ingest API over HTTP; errors propagate.
    Http(PutClient),
}

impl Sender {
    /// Ships one batch through the configured delivery mode.
    ///
    /// # Errors
    ///
    /// Only the [`Console`](Self::Console) and [`Http`](Self::Http) variants
    /// can fail; UDP send failures are logged and swallowed by design.
    pub fn send(&mut self, points: &[DataPoint], sanitizer: &Sanitizer) -> Result<(), SendError> {
        match self {
            Sender::Noop => Ok(()),
            Sender::Console { global_tags } => {
                let mut stdout = io::stdout().lock();
                write_console(&mut stdout, points, global_tags, sanitizer)?;
                Ok(())
            }
            Sender::Udp(forwarder) => {
                forwarder.forward(points, sanitizer);
                Ok(())
            }
            Sender::Http(client) => client.send(points, sanitizer),
        }
    }
}

fn write_console<W: Write>(
    out: &mut W,
    points: &[DataPoint],
    global_tags: &TagMap,
    sanitizer: &Sanitizer,
) -> io::Result<()> {
    let global_tags = (!global_tags.is_empty()).then_some(global_tags);
    let mut buf = Vec::new();
    for point in points {
        point.write_line(&mut buf, global_tags, sanitizer);
    }
    out.write_all(&buf)?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::{write_console, Sender};
    use crate::point::{DataPoint, TagMap};
    use crate::sanitize::{Policy, Sanitizer};

    #[test]
    fn noop_always_succeeds() {
        let points = vec![DataPoint::new("m", 1, 2i64, TagMap::new())];
        assert!(Sender::Noop.send(&points, &Sanitizer::default()).is_ok());
    }

    #[test]
    fn console_writes_line_protocol() {
        let mut globals = TagMap::new();
        globals.insert("dc".to_string(), "eu-1".to_string());
        let points = vec![
            DataPoint::new("proc.stat.cpu", 1515021070, 1515i64, TagMap::new()),
            DataPoint::new("proc.load.avg", 1515021070, 0.25f64, TagMap::new()),
        ];

        let mut out = Vec::new();
        write_console(&mut out, &points, &globals, &Sanitizer::new(Policy::Noop)).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "proc.stat.cpu 1515021070 1515 dc=eu-1\nproc.load.avg 1515021070 0.25 dc=eu-1\n"
        );
    }
}
