use forge_protocol::{Action, AgentBrain, AgentState, Position};

use crate::warehouse::{CHARGE, DROPOFF, PICKUP};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Goal {
    Pickup,
    Dropoff,
    Charge,
}

/// Greedy warehouse policy: fetch from the pickup column, deliver to the
/// dropoff column, detour to the charger row when the battery runs low.
#[derive(Debug, Clone)]
pub struct LogisticsBrain {
    grid_size: i64,
    charge_below: f64,
    charge_until: f64,
    charging: bool,
}

impl LogisticsBrain {
    pub fn new(grid_size: i64) -> Self {
        Self {
            grid_size,
            charge_below: 20.0,
            charge_until: 95.0,
            charging: false,
        }
    }

    pub fn with_charge_window(mut self, below: f64, until: f64) -> Self {
        self.charge_below = below;
        self.charge_until = until;
        self
    }

    fn goal(&mut self, observation: &AgentState) -> Goal {
        if observation.battery < self.charge_below {
            self.charging = true;
        } else if self.charging && observation.battery >= self.charge_until {
            self.charging = false;
        }

        let carrying = observation
            .field("carrying")
            .is_some_and(|value| !value.is_null());
        match (self.charging, carrying) {
            (true, _) => Goal::Charge,
            (false, true) => Goal::Dropoff,
            (false, false) => Goal::Pickup,
        }
    }

    fn target(&self, goal: Goal, from: Position) -> Position {
        match goal {
            Goal::Pickup => Position::new(0, from.y),
            Goal::Dropoff => Position::new(self.grid_size - 1, from.y),
            Goal::Charge => Position::new(from.x, self.grid_size - 1),
        }
    }
}

fn toward(from: Position, to: Position) -> Action {
    if from.x < to.x {
        Action::right()
    } else if from.x > to.x {
        Action::left()
    } else if from.y < to.y {
        Action::up()
    } else if from.y > to.y {
        Action::down()
    } else {
        Action::stay()
    }
}

impl AgentBrain for LogisticsBrain {
    fn choose_action(&mut self, observation: &AgentState) -> Action {
        let goal = self.goal(observation);
        let position = observation.position;
        let target = self.target(goal, position);
        if position != target {
            return toward(position, target);
        }
        match goal {
            Goal::Pickup => Action::new(PICKUP),
            Goal::Dropoff => Action::new(DROPOFF),
            Goal::Charge => Action::new(CHARGE),
        }
    }
}

#[cfg(test)]
mod tests {
    use forge_protocol::AgentId;
    use serde_json::json;

    use super::*;

    fn observe(x: i64, y: i64, battery: f64, carrying: bool) -> AgentState {
        let cargo = if carrying { json!("package") } else { json!(null) };
        AgentState::new(AgentId::indexed(0), Position::new(x, y), battery).with_field("carrying", cargo)
    }

    #[test]
    fn heads_for_pickup_when_empty() {
        let mut brain = LogisticsBrain::new(10);
        assert_eq!(brain.choose_action(&observe(4, 4, 80.0, false)), Action::left());
        assert_eq!(brain.choose_action(&observe(0, 4, 80.0, false)), Action::new(PICKUP));
    }

    #[test]
    fn delivers_when_carrying() {
        let mut brain = LogisticsBrain::new(10);
        assert_eq!(brain.choose_action(&observe(4, 4, 80.0, true)), Action::right());
        assert_eq!(brain.choose_action(&observe(9, 4, 80.0, true)), Action::new(DROPOFF));
    }

    #[test]
    fn charges_until_the_upper_threshold() {
        let mut brain = LogisticsBrain::new(10);
        assert_eq!(brain.choose_action(&observe(4, 4, 10.0, true)), Action::up());
        assert_eq!(brain.choose_action(&observe(4, 9, 50.0, true)), Action::new(CHARGE));
        assert_eq!(brain.choose_action(&observe(4, 9, 96.0, true)), Action::right());
    }
}
