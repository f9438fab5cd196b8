//! Presentation callback. The engine only promises a sorted, deduplicated,
//! catchable list; how it is drawn is the presenter's business.

use crate::transit::Departure;

pub trait Presenter: Send {
    /// Show a finished departure list, already sorted by urgency. At most
    /// the display capacity of entries is handed over.
    fn show_departures(&mut self, departures: &[Departure], direction_label: &str, placeholder: bool);

    /// Nothing to show: either genuinely no buses or a fetch problem;
    /// `reason` distinguishes the two.
    fn show_empty(&mut self, direction_label: &str, reason: &str);

    /// Outside active hours the board is just a clock.
    fn show_clock(&mut self, time: &str);
}

pub struct ConsolePresenter;

impl ConsolePresenter {
    fn clear_and_header(&self, direction_label: &str) {
        // Clear screen (ANSI escape code)
        print!("\x1B[2J\x1B[1;1H");
        println!(
            "Current Time: {}",
            chrono::Local::now().format("%H:%M:%S")
        );
        println!("Buses to {}", direction_label);
        println!("-----------------------------------------");
    }
}

impl Presenter for ConsolePresenter {
    fn show_departures(&mut self, departures: &[Departure], direction_label: &str, placeholder: bool) {
        self.clear_and_header(direction_label);
        if placeholder {
            println!("(showing placeholder data)");
        }
        for dep in departures {
            // '*' marks a live estimate rather than the timetable
            println!(
                "  {:>3}{} {} -> {}  at {}  leave in {} min ({})",
                dep.route,
                if dep.is_live { "*" } else { " " },
                dep.stop_name,
                dep.destination,
                dep.display_time,
                dep.leave_in(),
                dep.status_text
            );
        }
    }

    fn show_empty(&mut self, direction_label: &str, reason: &str) {
        self.clear_and_header(direction_label);
        println!("  No upcoming departures ({})", reason);
    }

    fn show_clock(&mut self, time: &str) {
        print!("\x1B[2J\x1B[1;1H");
        println!("{}", time);
    }
}
