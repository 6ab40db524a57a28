//! # Lifecycle states and transitions.
//!
//! A device walks a fixed state graph:
//!
//! ```text
//! Idle ──InitDevice──► InitializingDevice ──CompleteInit──► Initialized
//!   ▲                                                            │ Bind
//!   │ Auto                                                       ▼
//! ResettingDevice ◄──ResetDevice── DeviceReady ◄──Auto── Connecting ◄──Connect── Bound ◄──Auto── Binding
//!                                      │ InitTask
//!                                      ▼
//!                    ResettingTask ◄──ResetTask── Ready ──Run──► Running
//!                          │ Auto                   ▲              │
//!                          └──► DeviceReady         └────Stop──────┘
//! ```
//!
//! `ErrorFound` is legal from every live state and leads to [`State::Error`];
//! from there only `End` (to [`State::Exiting`]) is accepted.
//!
//! The table is pure data: [`State::apply`] answers "what does transition `t`
//! lead to from here", and [`State::transition_towards`] computes the next
//! request on the way to a target state (used by
//! [`DeviceHandle::transition_to`](crate::DeviceHandle::transition_to)).

use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Reserved result-state; never entered by the machine.
    Ok,
    /// Constructed, nothing initialized.
    Idle,
    /// Reading config and building channels (waits for `CompleteInit`).
    InitializingDevice,
    /// Channels built, transports created.
    Initialized,
    /// Attaching binding channels.
    Binding,
    /// All binding channels attached.
    Bound,
    /// Attaching connecting channels (with retry).
    Connecting,
    /// All channels attached.
    DeviceReady,
    /// Running the user `init_task` hook.
    InitializingTask,
    /// Ready to run.
    Ready,
    /// The run engine is active.
    Running,
    /// Running the user `reset_task` hook.
    ResettingTask,
    /// Tearing down transports and channels.
    ResettingDevice,
    /// Running the user `exit` hook; terminal.
    Exiting,
    /// A handler failed; waits for an external `End`.
    Error,
}

/// Named transition request between [`State`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    /// Advance out of a transient state; requested by the state handlers
    /// themselves when they complete without a newer pending transition.
    Auto,
    InitDevice,
    CompleteInit,
    Bind,
    Connect,
    InitTask,
    Run,
    Stop,
    ResetTask,
    ResetDevice,
    End,
    ErrorFound,
}

impl State {
    /// Returns the state that `transition` leads to from `self`, or `None`
    /// if the transition is not legal here.
    pub fn apply(self, transition: Transition) -> Option<State> {
        use State::*;
        use Transition::*;

        if transition == ErrorFound {
            return match self {
                Error | Exiting | Ok => None,
                _ => Some(Error),
            };
        }

        match (self, transition) {
            (Idle, InitDevice) => Some(InitializingDevice),
            (Idle, End) => Some(Exiting),
            (InitializingDevice, CompleteInit) => Some(Initialized),
            (Initialized, Bind) => Some(Binding),
            (Initialized, ResetDevice) => Some(ResettingDevice),
            (Binding, Auto) => Some(Bound),
            (Bound, Connect) => Some(Connecting),
            (Connecting, Auto) => Some(DeviceReady),
            (DeviceReady, InitTask) => Some(InitializingTask),
            (DeviceReady, ResetDevice) => Some(ResettingDevice),
            (InitializingTask, Auto) => Some(Ready),
            (Ready, Run) => Some(Running),
            (Ready, ResetTask) => Some(ResettingTask),
            (Running, Stop) => Some(Ready),
            (ResettingTask, Auto) => Some(DeviceReady),
            (ResettingDevice, Auto) => Some(Idle),
            (Error, End) => Some(Exiting),
            _ => None,
        }
    }

    /// Position of a state along the forward initialization chain.
    ///
    /// Used to decide whether a target lies "up" (towards Running) or "down"
    /// (towards Idle/Exiting) from the current state.
    fn rank(self) -> Option<u8> {
        use State::*;
        match self {
            Idle => Some(0),
            InitializingDevice => Some(1),
            Initialized => Some(2),
            Binding => Some(3),
            Bound => Some(4),
            Connecting => Some(5),
            DeviceReady => Some(6),
            InitializingTask => Some(7),
            Ready => Some(8),
            Running => Some(9),
            _ => None,
        }
    }

    /// Computes the next transition to request when steering the machine
    /// towards `target`.
    ///
    /// Returns `None` when no request should be made right now: either the
    /// machine sits in a transient state that advances on its own, or the
    /// target has been reached.
    pub fn transition_towards(self, target: State) -> Option<Transition> {
        use State::*;
        use Transition::*;

        if self == target {
            return None;
        }
        if self == Error || (self == Idle && target == Exiting) {
            return Some(End);
        }

        let (from, to) = (self.rank()?, target.rank().unwrap_or(0));
        if to > from {
            match self {
                Idle => Some(InitDevice),
                InitializingDevice => Some(CompleteInit),
                Initialized => Some(Bind),
                Bound => Some(Connect),
                DeviceReady => Some(InitTask),
                Ready => Some(Run),
                // transient, advances on its own
                _ => None,
            }
        } else {
            match self {
                Running => Some(Stop),
                Ready => Some(ResetTask),
                DeviceReady | Initialized => Some(ResetDevice),
                _ => None,
            }
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Ok => "Ok",
            State::Idle => "Idle",
            State::InitializingDevice => "InitializingDevice",
            State::Initialized => "Initialized",
            State::Binding => "Binding",
            State::Bound => "Bound",
            State::Connecting => "Connecting",
            State::DeviceReady => "DeviceReady",
            State::InitializingTask => "InitializingTask",
            State::Ready => "Ready",
            State::Running => "Running",
            State::ResettingTask => "ResettingTask",
            State::ResettingDevice => "ResettingDevice",
            State::Exiting => "Exiting",
            State::Error => "Error",
        };
        f.write_str(name)
    }
}

impl FromStr for State {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Ok" => Ok(State::Ok),
            "Idle" => Ok(State::Idle),
            "InitializingDevice" => Ok(State::InitializingDevice),
            "Initialized" => Ok(State::Initialized),
            "Binding" => Ok(State::Binding),
            "Bound" => Ok(State::Bound),
            "Connecting" => Ok(State::Connecting),
            "DeviceReady" => Ok(State::DeviceReady),
            "InitializingTask" => Ok(State::InitializingTask),
            "Ready" => Ok(State::Ready),
            "Running" => Ok(State::Running),
            "ResettingTask" => Ok(State::ResettingTask),
            "ResettingDevice" => Ok(State::ResettingDevice),
            "Exiting" => Ok(State::Exiting),
            "Error" => Ok(State::Error),
            other => Err(format!("unknown state '{other}'")),
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Transition::Auto => "Auto",
            Transition::InitDevice => "InitDevice",
            Transition::CompleteInit => "CompleteInit",
            Transition::Bind => "Bind",
            Transition::Connect => "Connect",
            Transition::InitTask => "InitTask",
            Transition::Run => "Run",
            Transition::Stop => "Stop",
            Transition::ResetTask => "ResetTask",
            Transition::ResetDevice => "ResetDevice",
            Transition::End => "End",
            Transition::ErrorFound => "ErrorFound",
        };
        f.write_str(name)
    }
}

impl FromStr for Transition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Auto" => Ok(Transition::Auto),
            "InitDevice" => Ok(Transition::InitDevice),
            "CompleteInit" => Ok(Transition::CompleteInit),
            "Bind" => Ok(Transition::Bind),
            "Connect" => Ok(Transition::Connect),
            "InitTask" => Ok(Transition::InitTask),
            "Run" => Ok(Transition::Run),
            "Stop" => Ok(Transition::Stop),
            "ResetTask" => Ok(Transition::ResetTask),
            "ResetDevice" => Ok(Transition::ResetDevice),
            "End" => Ok(Transition::End),
            "ErrorFound" => Ok(Transition::ErrorFound),
            other => Err(format!("unknown transition '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_chain_is_legal() {
        let steps = [
            (State::Idle, Transition::InitDevice, State::InitializingDevice),
            (State::InitializingDevice, Transition::CompleteInit, State::Initialized),
            (State::Initialized, Transition::Bind, State::Binding),
            (State::Binding, Transition::Auto, State::Bound),
            (State::Bound, Transition::Connect, State::Connecting),
            (State::Connecting, Transition::Auto, State::DeviceReady),
            (State::DeviceReady, Transition::InitTask, State::InitializingTask),
            (State::InitializingTask, Transition::Auto, State::Ready),
            (State::Ready, Transition::Run, State::Running),
            (State::Running, Transition::Stop, State::Ready),
        ];
        for (from, t, to) in steps {
            assert_eq!(from.apply(t), Some(to), "{from} --{t}--> {to}");
        }
    }

    #[test]
    fn run_is_not_legal_from_idle() {
        assert_eq!(State::Idle.apply(Transition::Run), None);
    }

    #[test]
    fn error_found_from_any_live_state() {
        for s in [State::Idle, State::Connecting, State::Running, State::ResettingDevice] {
            assert_eq!(s.apply(Transition::ErrorFound), Some(State::Error));
        }
        assert_eq!(State::Error.apply(Transition::ErrorFound), None);
        assert_eq!(State::Exiting.apply(Transition::ErrorFound), None);
    }

    #[test]
    fn only_end_leaves_error() {
        assert_eq!(State::Error.apply(Transition::End), Some(State::Exiting));
        assert_eq!(State::Error.apply(Transition::Run), None);
        assert_eq!(State::Error.apply(Transition::ResetDevice), None);
    }

    #[test]
    fn pathing_steps_up_and_down() {
        assert_eq!(
            State::Idle.transition_towards(State::Running),
            Some(Transition::InitDevice)
        );
        assert_eq!(
            State::Bound.transition_towards(State::Running),
            Some(Transition::Connect)
        );
        // transient states advance on their own
        assert_eq!(State::Connecting.transition_towards(State::Running), None);
        // downwards
        assert_eq!(
            State::Running.transition_towards(State::Idle),
            Some(Transition::Stop)
        );
        assert_eq!(
            State::Ready.transition_towards(State::Idle),
            Some(Transition::ResetTask)
        );
        assert_eq!(
            State::Idle.transition_towards(State::Exiting),
            Some(Transition::End)
        );
        assert_eq!(
            State::Error.transition_towards(State::Exiting),
            Some(Transition::End)
        );
    }

    #[test]
    fn names_round_trip() {
        for s in [State::Idle, State::DeviceReady, State::Error] {
            assert_eq!(s.to_string().parse::<State>().unwrap(), s);
        }
        for t in [Transition::Auto, Transition::CompleteInit, Transition::ErrorFound] {
            assert_eq!(t.to_string().parse::<Transition>().unwrap(), t);
        }
    }
}
