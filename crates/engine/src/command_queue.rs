use protocol::CanvasCommand;
use rtrb::{Consumer, PopError, Producer, PushError, RingBuffer};

/// UI side of the command ring. Single producer; not `Clone`.
pub struct CommandSender {
    producer: Producer<CanvasCommand>,
}

/// Engine side of the command ring, drained by [`crate::CanvasEngine::pump`].
pub struct CommandReceiver {
    consumer: Consumer<CanvasCommand>,
}

pub fn command_queue(capacity: usize) -> (CommandSender, CommandReceiver) {
    assert!(capacity > 0, "command queue capacity must be greater than zero");
    let (producer, consumer) = RingBuffer::new(capacity);
    (CommandSender { producer }, CommandReceiver { consumer })
}

impl CommandSender {
    pub fn push(&mut self, command: CanvasCommand) -> Result<(), PushError<CanvasCommand>> {
        self.producer.push(command)
    }

    /// Spins until the ring has room. Hands the command back if the engine
    /// side has been dropped and will never drain it.
    pub fn blocking_push(&mut self, mut command: CanvasCommand) -> Result<(), CanvasCommand> {
        loop {
            match self.producer.push(command) {
                Ok(()) => return Ok(()),
                Err(PushError::Full(returned_command)) => {
                    if self.producer.is_abandoned() {
                        return Err(returned_command);
                    }
                    command = returned_command;
                    std::thread::yield_now();
                }
            }
        }
    }
}

impl CommandReceiver {
    pub fn pop(&mut self) -> Result<CanvasCommand, PopError> {
        self.consumer.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocking_push_returns_command_when_engine_side_is_gone() {
        let (mut sender, receiver) = command_queue(1);
        sender
            .blocking_push(CanvasCommand::AddLayer)
            .expect("ring has room");
        drop(receiver);

        assert_eq!(
            sender.blocking_push(CanvasCommand::ResetState),
            Err(CanvasCommand::ResetState)
        );
    }
}
