//! Text output over the first UART 16550 (COM1).
//!
//! `serial_print!` and `serial_println!` are the kernel's only console; the
//! logger writes through them as well.

#[cfg(not(test))]
mod port {
    use core::fmt::{Arguments, Write};

    use lazy_static::lazy_static;
    use spin::Mutex;
    use uart_16550::SerialPort;

    use crate::{constants::ports::SERIAL_PORT, memory::without_interrupts};

    lazy_static! {
        /// COM1, initialized on first use.
        pub static ref COM1: Mutex<SerialPort> = {
            let mut port = unsafe { SerialPort::new(SERIAL_PORT) };
            port.init();
            Mutex::new(port)
        };
    }

    pub fn write(args: Arguments) {
        without_interrupts(|| {
            let _ = COM1.lock().write_fmt(args);
        });
    }
}

#[cfg(not(test))]
pub use port::COM1;

#[doc(hidden)]
pub fn _print(args: ::core::fmt::Arguments) {
    #[cfg(not(test))]
    port::write(args);

    // Host test runs print to standard output.
    #[cfg(test)]
    std::print!("{}", args);
}

/// Prints formatted text to the serial port.
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*))
    };
}

/// Prints formatted text to the serial port, followed by a newline.
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)));
}
