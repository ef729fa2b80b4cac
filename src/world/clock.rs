use serde::{Deserialize, Serialize};

/// Gates one sub-update of the world pass to run at most once per `interval` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Throttle {
    pub interval: u64,
    pub last: u64,
}
impl Throttle {
    pub fn new(interval: u64) -> Self {
        Self { interval, last: 0 }
    }
    /// True (and rearms) if a full interval has passed since the last run.
    pub fn ready(&mut self, now: u64) -> bool {
        if now.saturating_sub(self.last) >= self.interval {
            self.last = now;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Weather {
    Clear,
    Cloudy,
    Rain,
    Storm,
}
impl Weather {
    /// One step lighter (`-1`) or heavier (`1`).
    pub fn shift(self, by: i8) -> Self {
        const ORDER: [Weather; 4] = [Weather::Clear, Weather::Cloudy, Weather::Rain, Weather::Storm];
        let at = ORDER.iter().position(|w| *w == self).unwrap_or(0) as i8;
        ORDER[(at + by).clamp(0, 3) as usize]
    }
    pub fn announcement(self) -> &'static str {
        match self {
            Weather::Clear => "The clouds part and the sky clears.",
            Weather::Cloudy => "Clouds gather overhead.",
            Weather::Rain => "It starts to rain.",
            Weather::Storm => "Thunder rolls as a storm breaks.",
        }
    }
}

/// Time of day, one game hour per `seconds_per_hour` real seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Calendar {
    pub hour: u8,
}
impl Calendar {
    pub const DAWN: u8 = 6;
    pub const DUSK: u8 = 20;

    pub fn is_day(&self) -> bool {
        (Self::DAWN..Self::DUSK).contains(&self.hour)
    }
    /// Advances one hour and says what, if anything, players should be told.
    pub fn advance(&mut self) -> Option<&'static str> {
        self.hour = (self.hour + 1) % 24;
        match self.hour {
            Self::DAWN => Some("The sun rises."),
            Self::DUSK => Some("The sun sets."),
            0 => Some("It is midnight."),
            _ => None,
        }
    }
}
impl Default for Calendar {
    fn default() -> Self {
        Self { hour: 8 }
    }
}

/// The world's wall-clock bookkeeping. Kept across reboots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldTimers {
    pub calendar: Calendar,
    pub weather: Weather,
    pub hour: Throttle,
    pub weather_update: Throttle,
    pub random_update: Throttle,
}
