pub mod compare;
pub mod load;

use owo_colors::OwoColorize;

pub(crate) fn use_color() -> bool {
    atty::is(atty::Stream::Stdout)
}

/// `label: value`, with the value highlighted on a terminal.
pub(crate) fn print_field(label: &str, value: impl std::fmt::Display) {
    if use_color() {
        println!("{}: {}", label, value.to_string().bright_white());
    } else {
        println!("{}: {}", label, value);
    }
}
