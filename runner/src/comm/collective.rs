use super::{mesh, CommError, Communicator, Control, Packet};
use itertools::Itertools;
use tracing::trace;

// Collectives are rooted at a single rank and must be entered by every rank of the
// communicator in the same order. Since each pair of ranks has its own FIFO control
// channel, a rank that already moved on to the next collective cannot disturb the
// root of the current one.

impl Communicator {
    /// Broadcast `packet` from `root` to every rank, the root has to provide the packet
    pub fn bcast(&self, root: usize, packet: Option<Packet>) -> Result<Packet, CommError> {
        self.check(root)?;

        if self.rank == root {
            let packet = packet.ok_or(CommError::MissingRootPacket)?;

            for peer in (0..self.size()).filter(|peer| *peer != root) {
                self.control_send(peer, Control::Data(packet.clone()))?;
            }

            Ok(packet)
        } else {
            match self.control_recv(root)? {
                Control::Data(packet) => Ok(packet),
                _ => Err(CommError::Collective {
                    peer: root,
                    operation: "broadcast",
                }),
            }
        }
    }

    pub fn barrier(&self) -> Result<(), CommError> {
        if self.rank == 0 {
            for peer in 1..self.size() {
                match self.control_recv(peer)? {
                    Control::Arrived => {}
                    _ => {
                        return Err(CommError::Collective {
                            peer,
                            operation: "barrier",
                        })
                    }
                }
            }

            for peer in 1..self.size() {
                self.control_send(peer, Control::Release)?;
            }

            Ok(())
        } else {
            self.control_send(0, Control::Arrived)?;

            match self.control_recv(0)? {
                Control::Release => Ok(()),
                _ => Err(CommError::Collective {
                    peer: 0,
                    operation: "barrier",
                }),
            }
        }
    }

    /// Split into disjoint communicators, one per distinct `color`.
    ///
    /// Ranks passing `None` take part in the collective but receive no communicator.
    /// Within a new communicator ranks are ordered by `(key, old rank)`.
    pub fn split(&self, color: Option<usize>, key: usize) -> Result<Option<Self>, CommError> {
        if self.rank != 0 {
            self.control_send(0, Control::Split { color, key })?;

            return match self.control_recv(0)? {
                Control::Assigned(communicator) => Ok(communicator),
                _ => Err(CommError::Collective {
                    peer: 0,
                    operation: "split",
                }),
            };
        }

        let mut requests = Vec::with_capacity(self.size());
        requests.push((color, key));

        for peer in 1..self.size() {
            match self.control_recv(peer)? {
                Control::Split { color, key } => requests.push((color, key)),
                _ => {
                    return Err(CommError::Collective {
                        peer,
                        operation: "split",
                    })
                }
            }
        }

        let groups = requests
            .iter()
            .enumerate()
            .filter_map(|(rank, (color, key))| color.map(|color| (color, (*key, rank))))
            .into_group_map();

        let mut assigned = (0..self.size()).map(|_| None).collect::<Vec<_>>();

        for (color, mut members) in groups {
            members.sort_unstable();
            trace!(
                context = self.context,
                color,
                size = members.len(),
                "split off group"
            );

            let handles = mesh(members.len());
            for ((_, rank), handle) in members.into_iter().zip(handles) {
                assigned[rank] = Some(handle);
            }
        }

        let mut assigned = assigned.into_iter();
        let own = assigned.next().flatten();

        for (peer, communicator) in assigned.enumerate() {
            self.control_send(peer + 1, Control::Assigned(communicator))?;
        }

        Ok(own)
    }
}

#[cfg(test)]
mod tests {
    use crate::comm::{Packet, Universe};

    #[test]
    fn split_orders_by_key_then_rank() {
        // even ranks in reverse order, odd ranks excluded
        let layouts = Universe::launch(6, |world| {
            let color = (world.rank() % 2 == 0).then_some(0);
            let key = world.size() - world.rank();

            world
                .split(color, key)
                .unwrap()
                .map(|sub| (sub.rank(), sub.size()))
        })
        .unwrap();

        assert_eq!(
            layouts,
            vec![Some((2, 3)), None, Some((1, 3)), None, Some((0, 3)), None]
        );
    }

    #[test]
    fn broadcast_from_non_zero_root() {
        let received = Universe::launch(4, |world| {
            let packet = (world.rank() == 2).then(|| Packet::new(11, b"config".to_vec()));
            world.bcast(2, packet).unwrap()
        })
        .unwrap();

        assert!(received
            .iter()
            .all(|packet| *packet == Packet::new(11, b"config".to_vec())));
    }

    #[test]
    fn collectives_in_sequence_do_not_interleave() {
        let sizes = Universe::launch(5, |world| {
            world.barrier().unwrap();
            let packet = (world.rank() == 4).then(|| Packet::empty(1));
            world.bcast(4, packet).unwrap();
            let sub = world.split(Some(world.rank() / 3), world.rank()).unwrap();
            world.barrier().unwrap();

            sub.map(|sub| sub.size())
        })
        .unwrap();

        assert_eq!(sizes, vec![Some(3), Some(3), Some(3), Some(2), Some(2)]);
    }

    #[test]
    fn split_groups_communicate_independently() {
        let sums = Universe::launch(4, |world| {
            let sub = world.split(Some(world.rank() % 2), world.rank()).unwrap().unwrap();

            if sub.rank() == 0 {
                let peer = sub.recv(1).unwrap();
                Some(peer.body[0] as usize + world.rank())
            } else {
                sub.send(0, Packet::new(0, vec![world.rank() as u8])).unwrap();
                None
            }
        })
        .unwrap();

        assert_eq!(sums, vec![Some(2), Some(4), None, None]);
    }
}
