use super::message::ProcessId;

/// Static, ordered membership for the lifetime of a run. The order must be
/// identical on every process.
#[derive(Debug, Clone)]
pub struct Peers {
    members: Vec<ProcessId>,
    self_id: ProcessId,
}

impl Peers {
    pub fn new(members: Vec<ProcessId>, self_id: ProcessId) -> Self {
        Peers { members, self_id }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn self_id(&self) -> ProcessId {
        self.self_id
    }

    pub fn is_member(&self, id: ProcessId) -> bool {
        self.members.contains(&id)
    }

    /// Every member except this process, in membership order.
    pub fn others(&self) -> impl Iterator<Item = ProcessId> + '_ {
        self.members
            .iter()
            .copied()
            .filter(move |&id| id != self.self_id)
    }

    /// Acks required to finalize a message: one from every other member.
    pub fn ack_quorum(&self) -> usize {
        self.members.len() - 1
    }
}
