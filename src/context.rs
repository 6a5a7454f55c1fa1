use crate::cachebuster::Clock;

pub(crate) struct Data<P> {
    pub platform: P,
    pub clock: Box<dyn Clock>,
}
