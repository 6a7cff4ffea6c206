/// Offset-ordered queue of blocked readers on one file handle.
///
/// Entries are plain values owned by the handle (the waiters block on the
/// handle's condvar and identify their slot by ticket). Rewinding marks
/// every current member when one waiter gives up on being read into order
/// and close/reopens the stream itself; the marked members then refuse to
/// do the same until they are dequeued.
#[derive(Default)]
pub struct ReadQueue {
    waiters: Vec<Waiter>,
    next_ticket: u64,
}

struct Waiter {
    ticket: u64,
    offset: u64,
    rewinding: bool,
}

impl ReadQueue {
    pub fn enqueue(&mut self, offset: u64) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        let at = self
            .waiters
            .iter()
            .position(|w| w.offset > offset)
            .unwrap_or(self.waiters.len());
        self.waiters.insert(
            at,
            Waiter {
                ticket,
                offset,
                rewinding: false,
            },
        );
        ticket
    }

    pub fn dequeue(&mut self, ticket: u64) {
        self.waiters.retain(|w| w.ticket != ticket);
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub fn is_head(&self, ticket: u64) -> bool {
        self.waiters
            .first()
            .map(|w| w.ticket == ticket)
            .unwrap_or(false)
    }

    pub fn is_rewinding(&self, ticket: u64) -> bool {
        self.waiters
            .iter()
            .find(|w| w.ticket == ticket)
            .map(|w| w.rewinding)
            .unwrap_or(false)
    }

    pub fn mark_all_rewinding(&mut self) {
        for w in &mut self.waiters {
            w.rewinding = true;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn keeps_ascending_offset_order() {
        let mut q = ReadQueue::default();
        let t30 = q.enqueue(30);
        let t10 = q.enqueue(10);
        let t20 = q.enqueue(20);
        assert!(q.is_head(t10));
        q.dequeue(t10);
        assert!(q.is_head(t20));
        assert!(!q.is_head(t30));
    }

    #[test]
    fn rewinding_marks_current_members_only() {
        let mut q = ReadQueue::default();
        let t1 = q.enqueue(100);
        q.mark_all_rewinding();
        assert!(q.is_rewinding(t1));
        let t2 = q.enqueue(200);
        assert!(!q.is_rewinding(t2));
    }
}
