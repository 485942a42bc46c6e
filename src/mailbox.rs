use std::collections::VecDeque;

use torq_klvm::Envelope;

/// The priority-ordered envelope queue local to each actor.
///
/// An envelope is appended at the tail and then bubble-swapped toward the
/// head while it has strictly higher priority (a lower priority number) than
/// its predecessor. Higher-priority envelopes therefore run first while FIFO
/// order is preserved within a priority class.
#[derive(Default)]
pub struct Mailbox {
    queue: VecDeque<Envelope>,
}

impl Mailbox {
    pub fn new() -> Mailbox {
        Mailbox::default()
    }

    pub fn insert(&mut self, envelope: Envelope) {
        self.queue.push_back(envelope);
        let mut at = self.queue.len() - 1;
        while at > 0 && self.queue[at].priority() < self.queue[at - 1].priority() {
            self.queue.swap(at, at - 1);
            at -= 1;
        }
    }

    pub fn peek_next(&self) -> Option<&Envelope> {
        self.queue.front()
    }

    pub fn remove_next(&mut self) -> Option<Envelope> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use torq_klvm::{ActorRef, Address, Complete, ControlMessage, Envelope, RequestId};

    use super::Mailbox;

    #[derive(Debug)]
    struct NullActor {
        address: Address,
    }

    impl ActorRef for NullActor {
        fn address(&self) -> &Address {
            &self.address
        }

        fn send(&self, _envelope: Envelope) {}
    }

    fn requester() -> Arc<dyn ActorRef> {
        Arc::new(NullActor {
            address: Address::new("requester"),
        })
    }

    fn notify(text: &str) -> Envelope {
        Envelope::notify(Complete::str(text))
    }

    fn request(text: &str) -> Envelope {
        Envelope::request(Complete::str(text), requester(), RequestId::Nothing)
    }

    fn response(text: &str) -> Envelope {
        Envelope::response(Complete::str(text), RequestId::Nothing)
    }

    fn control() -> Envelope {
        Envelope::control_notify(ControlMessage::Resume)
    }

    fn priorities(mailbox: &mut Mailbox) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(envelope) = mailbox.remove_next() {
            out.push(envelope.priority());
        }
        out
    }

    #[test]
    fn control_overtakes_notify_and_request() {
        // Enqueue N1, R1, C1; dequeue C1, N1, R1.
        let mut mailbox = Mailbox::new();
        mailbox.insert(notify("n1"));
        mailbox.insert(request("r1"));
        mailbox.insert(control());
        let first = mailbox.remove_next().unwrap();
        assert!(first.is_control());
        let second = mailbox.remove_next().unwrap();
        assert!(second.is_notify());
        assert_eq!(
            second.value().unwrap().to_string(),
            Complete::str("n1").to_string()
        );
        let third = mailbox.remove_next().unwrap();
        assert!(third.is_request());
    }

    #[test]
    fn responses_overtake_requests_but_not_controls() {
        let mut mailbox = Mailbox::new();
        mailbox.insert(control());
        mailbox.insert(request("r1"));
        mailbox.insert(response("a"));
        mailbox.insert(response("b"));
        assert_eq!(priorities(&mut mailbox), vec![0, 1, 1, 2]);
    }

    #[test]
    fn fifo_within_a_priority_class() {
        let mut mailbox = Mailbox::new();
        mailbox.insert(notify("first"));
        mailbox.insert(request("second"));
        mailbox.insert(notify("third"));
        let order: Vec<String> = std::iter::from_fn(|| mailbox.remove_next())
            .map(|envelope| envelope.value().unwrap().to_string())
            .collect();
        assert_eq!(order, vec!["'first'", "'second'", "'third'"]);
    }

    #[test]
    fn adjacent_priorities_never_invert() {
        let mut mailbox = Mailbox::new();
        let inserts = [2u8, 1, 2, 0, 1, 2, 0, 1];
        for priority in inserts {
            let envelope = match priority {
                0 => control(),
                1 => response("r"),
                _ => notify("n"),
            };
            mailbox.insert(envelope);
        }
        let drained = priorities(&mut mailbox);
        for pair in drained.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
    }
}
