//! The bounded set of connections the event loop watches

/// Most entries the set will hold: the bus, the listeners, and every
/// connected text monitor
pub const WATCH_CAPACITY: usize = 16;

/// The kind of a watched connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Serial,
    LocalCommand,
    Inet4Command,
    Inet6Command,
    Inet4Text,
    Inet6Text,
    ConnectedText,
}

/// One watched connection, with everything known about it
#[derive(Debug)]
pub struct WatchEntry<C> {
    pub kind: Kind,
    pub conn: C,
    /// Only ever set on [Kind::ConnectedText] entries
    pub report_interrupts: bool,
}

/// The watch set
///
/// Removing an entry keeps the others in their relative order.
#[derive(Debug)]
pub struct WatchSet<C> {
    entries: heapless::Vec<WatchEntry<C>, WATCH_CAPACITY>,
}

impl<C> Default for WatchSet<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> WatchSet<C> {
    pub fn new() -> Self {
        Self {
            entries: heapless::Vec::new(),
        }
    }

    /// Add a connection, handing it back if the set is full
    pub fn push(&mut self, kind: Kind, conn: C) -> Result<(), C> {
        self.entries
            .push(WatchEntry {
                kind,
                conn,
                report_interrupts: false,
            })
            .map_err(|e| e.conn)
    }

    /// Remove the entry at `idx`, shifting the later ones down
    pub fn remove(&mut self, idx: usize) -> Option<WatchEntry<C>> {
        if idx >= self.entries.len() {
            return None;
        }
        self.entries[idx..].rotate_left(1);
        self.entries.pop()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.is_full()
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut WatchEntry<C>> {
        self.entries.get_mut(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WatchEntry<C>> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut WatchEntry<C>> {
        self.entries.iter_mut()
    }

    /// Count of entries of the given kind
    pub fn count(&self, kind: Kind) -> usize {
        self.entries.iter().filter(|e| e.kind == kind).count()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn names(set: &WatchSet<&'static str>) -> Vec<&'static str> {
        set.iter().map(|e| e.conn).collect()
    }

    #[test]
    fn compaction() {
        let mut set = WatchSet::new();
        set.push(Kind::Serial, "bus").unwrap();
        set.push(Kind::LocalCommand, "unix").unwrap();
        for name in ["a", "b", "c", "d"] {
            set.push(Kind::ConnectedText, name).unwrap();
        }
        set.get_mut(4).unwrap().report_interrupts = true;

        let gone = set.remove(3).unwrap();
        assert_eq!(gone.conn, "b");
        assert_eq!(names(&set), ["bus", "unix", "a", "c", "d"]);
        assert_eq!(set.len(), 5);
        // The flag moved with its entry
        assert!(set.iter().nth(3).unwrap().report_interrupts);
        assert!(!set.iter().nth(2).unwrap().report_interrupts);

        set.remove(4).unwrap();
        assert_eq!(names(&set), ["bus", "unix", "a", "c"]);
        assert!(set.remove(4).is_none());
        assert_eq!(set.count(Kind::ConnectedText), 2);
    }

    #[test]
    fn bounded() {
        let mut set = WatchSet::new();
        for _ in 0..WATCH_CAPACITY {
            set.push(Kind::ConnectedText, 0u8).unwrap();
        }
        assert!(set.is_full());
        assert_eq!(set.push(Kind::ConnectedText, 7u8), Err(7));
        assert_eq!(set.len(), WATCH_CAPACITY);
    }
}
