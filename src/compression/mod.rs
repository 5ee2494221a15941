pub mod riemann;
pub mod conical;
