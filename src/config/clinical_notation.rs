//! A line-oriented parser for abbreviated bedside dosing shorthand, e.g.
//!
//! ```text
//! ; induction then a step-down infusion
//! BOLUS 140 AT 0
//! RATE 200 AT 0
//! RATE 140 AT 30
//! STOP AT 120
//! ```
//!
//! Each line stands alone; order in the file does not need to match dose
//! time order since `DoseSchedule::add` inserts in sorted position.

use std::path::Path;

use crate::dosing::{DoseEvent, DoseSchedule};
use crate::error::{PKError, PKResult};

pub fn parse_file<P: AsRef<Path>>(path: P) -> PKResult<DoseSchedule> {
    let content = std::fs::read_to_string(path)?;
    parse_str(&content)
}

pub fn parse_str(content: &str) -> PKResult<DoseSchedule> {
    let mut parser = NotationParser::new(content);
    parser.parse()
}

struct NotationParser {
    lines: Vec<String>,
    current_line: usize,
}

impl NotationParser {
    fn new(content: &str) -> Self {
        let lines: Vec<String> = content
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty() && !line.starts_with(';'))
            .collect();

        Self {
            lines,
            current_line: 0,
        }
    }

    fn parse(&mut self) -> PKResult<DoseSchedule> {
        let mut schedule = DoseSchedule::new();

        while self.current_line < self.lines.len() {
            let line = self.lines[self.current_line].clone();
            let tokens: Vec<&str> = line.split_whitespace().collect();

            match tokens.first().copied() {
                Some("BOLUS") => self.parse_bolus(&tokens, &mut schedule)?,
                Some("RATE") => self.parse_rate(&tokens, &mut schedule)?,
                Some("STOP") => self.parse_stop(&tokens, &mut schedule)?,
                Some(other) => {
                    return Err(PKError::InvalidDoseEvent(format!(
                        "unrecognized dosing directive '{other}' on line {}",
                        self.current_line + 1
                    )));
                }
                None => {}
            }
            self.current_line += 1;
        }

        Ok(schedule)
    }

    fn parse_bolus(&self, tokens: &[&str], schedule: &mut DoseSchedule) -> PKResult<()> {
        // BOLUS <mg> AT <t_minutes>
        let (mg, t) = self.expect_value_at(tokens, "BOLUS")?;
        schedule.add(DoseEvent::new(t, mg, 0.0)?)
    }

    fn parse_rate(&self, tokens: &[&str], schedule: &mut DoseSchedule) -> PKResult<()> {
        // RATE <mg_per_hr> AT <t_minutes>
        let (rate, t) = self.expect_value_at(tokens, "RATE")?;
        schedule.add(DoseEvent::new(t, 0.0, rate)?)
    }

    fn parse_stop(&self, tokens: &[&str], schedule: &mut DoseSchedule) -> PKResult<()> {
        // STOP AT <t_minutes>
        if tokens.len() != 3 || tokens[1] != "AT" {
            return self.malformed("STOP");
        }
        let t = self.parse_number(tokens[2], "STOP")?;
        schedule.add(DoseEvent::new(t, 0.0, 0.0)?)
    }

    fn expect_value_at(&self, tokens: &[&str], directive: &str) -> PKResult<(f64, f64)> {
        if tokens.len() != 4 || tokens[2] != "AT" {
            return self.malformed(directive);
        }
        let value = self.parse_number(tokens[1], directive)?;
        let t = self.parse_number(tokens[3], directive)?;
        Ok((value, t))
    }

    fn parse_number(&self, token: &str, directive: &str) -> PKResult<f64> {
        token.parse::<f64>().map_err(|_| {
            PKError::InvalidDoseEvent(format!(
                "expected a number after {directive} on line {}, got '{token}'",
                self.current_line + 1
            ))
        })
    }

    fn malformed<T>(&self, directive: &str) -> PKResult<T> {
        Err(PKError::InvalidDoseEvent(format!(
            "malformed {directive} directive on line {}, expected '{directive} <value> AT <t_minutes>'",
            self.current_line + 1
        )))
    }
}
