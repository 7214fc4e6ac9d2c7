use {crate::prelude::*, colored::ColoredString};

/// Grey horizontal rule, returned so callers can embed it between a heading
/// and the detail that follows.
pub(crate) fn rule() -> ColoredString {
    "\n────────────────────────\n".truecolor(110, 110, 110)
}

/// Print the heading of the command being executed.
#[macro_export]
macro_rules! command_title {
    ($($heading:tt)*) => {
        println!(
            "{marker} {heading}{rule}",
            marker = "»".bold().cyan(),
            heading = format!($($heading)*).bold(),
            rule = $crate::display::rule()
        );
    };
}
